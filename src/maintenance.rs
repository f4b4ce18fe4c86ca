//! Secret protected endpoint for triggering maintenance actions.
//!
//! The embedding addon registers named async callbacks; an operator runs
//! one with `POST <path>?action=<name>` carrying the maintenance secret in
//! the `X-Maintenance-Secret` header, the `secret` query parameter or a
//! `secret` body field.

use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use axum::extract::{FromRequest, Query, Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Form, Json, Router};
use dashmap::DashMap;

use crate::util::{random_secret, secrets_match};
use crate::KitsasAddon;

pub const DEFAULT_PATH: &str = "/launch_maintenance";
pub const SECRET_HEADER: &str = "x-maintenance-secret";

pub type MaintenanceFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
pub type MaintenanceFn = Arc<dyn Fn() -> MaintenanceFuture + Send + Sync>;

struct MaintenanceInner {
    path: String,
    secret: String,
    functions: DashMap<String, MaintenanceFn>,
}

/// Registry of maintenance actions mounted on the addon.
#[derive(Clone)]
pub struct MaintenanceRouter {
    inner: Arc<MaintenanceInner>,
}

impl MaintenanceRouter {
    /// Mount at [`DEFAULT_PATH`].
    pub fn new(addon: &mut KitsasAddon, secret: Option<String>) -> Self {
        Self::with_path(addon, DEFAULT_PATH, secret)
    }

    /// Mount at `path`. The secret falls back to `MAINTENANCE_SECRET` and
    /// then to a random value nobody outside the process knows.
    pub fn with_path(addon: &mut KitsasAddon, path: &str, secret: Option<String>) -> Self {
        let secret = match secret
            .filter(|s| !s.is_empty())
            .or_else(|| std::env::var("MAINTENANCE_SECRET").ok().filter(|s| !s.is_empty()))
        {
            Some(secret) => secret,
            None => {
                tracing::warn!(
                    path,
                    "MAINTENANCE_SECRET not set, generated a random secret; maintenance actions cannot be triggered externally"
                );
                random_secret()
            }
        };
        let inner = Arc::new(MaintenanceInner {
            path: path.to_owned(),
            secret,
            functions: DashMap::new(),
        });
        let router = Router::new()
            .route("/", post(launch))
            .with_state(inner.clone());
        addon.create_router(path, false).merge(router);
        Self { inner }
    }

    /// Register `func` under `name`, replacing any earlier registration.
    pub fn add_function<F, Fut>(&self, name: impl Into<String>, func: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let func: MaintenanceFn = Arc::new(move || Box::pin(func()) as MaintenanceFuture);
        self.inner.functions.insert(name.into(), func);
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.inner.functions.contains_key(name)
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    pub fn secret(&self) -> &str {
        &self.inner.secret
    }
}

/// String fields of a JSON or url-encoded body. Anything else, or a body
/// that does not parse, yields no fields.
struct BodyFields(HashMap<String, String>);

#[axum::async_trait]
impl<S> FromRequest<S> for BodyFields
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let content_type = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();
        let fields = if content_type.starts_with("application/json") {
            match Json::<serde_json::Map<String, serde_json::Value>>::from_request(req, state).await {
                Ok(Json(map)) => map
                    .into_iter()
                    .map(|(k, v)| match v {
                        serde_json::Value::String(s) => (k, s),
                        other => (k, other.to_string()),
                    })
                    .collect(),
                Err(_) => HashMap::new(),
            }
        } else if content_type.starts_with("application/x-www-form-urlencoded") {
            match Form::<HashMap<String, String>>::from_request(req, state).await {
                Ok(Form(map)) => map,
                Err(_) => HashMap::new(),
            }
        } else {
            HashMap::new()
        };
        Ok(Self(fields))
    }
}

async fn launch(
    State(inner): State<Arc<MaintenanceInner>>,
    headers: HeaderMap,
    query: Option<Query<HashMap<String, String>>>,
    BodyFields(body): BodyFields,
) -> Response {
    let query = query.map(|Query(q)| q).unwrap_or_default();

    let supplied = headers
        .get(SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .or_else(|| query.get("secret").cloned())
        .or_else(|| body.get("secret").cloned());
    let authorized = supplied
        .as_deref()
        .is_some_and(|s| secrets_match(s, &inner.secret));
    if !authorized {
        tracing::warn!(path = %inner.path, "maintenance request with invalid secret");
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }

    let Some(action) = query
        .get("action")
        .or_else(|| body.get("action"))
        .filter(|a| !a.is_empty())
        .cloned()
    else {
        return (StatusCode::BAD_REQUEST, "Action is required").into_response();
    };

    let func = inner.functions.get(&action).map(|entry| entry.value().clone());
    let Some(func) = func else {
        tracing::warn!(action = %action, "unknown maintenance action");
        return (StatusCode::BAD_REQUEST, "Action not found").into_response();
    };

    match func().await {
        Ok(()) => {
            tracing::info!(action = %action, "maintenance action executed");
            (StatusCode::OK, format!("Maintenance {} executed", action)).into_response()
        }
        Err(err) => {
            tracing::error!(action = %action, error = %err, "maintenance action failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Maintenance {} failed", action),
            )
                .into_response()
        }
    }
}
