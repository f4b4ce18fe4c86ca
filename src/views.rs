//! Template rendering for the built-in `unready` and `error` pages.
//!
//! Templates are looked up as `<views_path>/<name>.<view_engine>` and
//! rendered with minijinja. Every render has a plain-text fallback so a
//! missing or broken template never turns into a failed response.

use std::path::Path;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use minijinja::{context, Environment};

#[derive(Clone)]
pub struct Views {
    env: Arc<Environment<'static>>,
    extension: String,
}

impl Views {
    pub fn new(views_path: &str, extension: &str, app_name: &str, base_url: &str) -> Self {
        let mut env = Environment::new();
        if Path::new(views_path).is_dir() {
            env.set_loader(minijinja::path_loader(views_path));
        }
        env.add_global("appName", app_name.to_owned());
        env.add_global("baseUrl", base_url.to_owned());
        Self {
            env: Arc::new(env),
            extension: extension.trim_start_matches('.').to_owned(),
        }
    }

    pub fn render(&self, view: &str, message: Option<&str>) -> Result<String, minijinja::Error> {
        let name = format!("{}.{}", view, self.extension);
        let template = self.env.get_template(&name)?;
        template.render(context! { message => message })
    }

    /// Render `view` with `status`, or answer with `fallback` as plain text.
    pub fn respond(
        &self,
        status: StatusCode,
        view: &str,
        message: Option<&str>,
        fallback: &str,
    ) -> Response {
        match self.render(view, message) {
            Ok(body) => (status, Html(body)).into_response(),
            Err(err) => {
                tracing::debug!(view, error = %err, "view not rendered, sending plain text");
                (status, fallback.to_owned()).into_response()
            }
        }
    }
}
