//! Structured logging: the access log record and its formatter, the
//! middleware that emits it as `tracing` fields, and the JSON subscriber
//! used by addon binaries.

use std::time::Instant;

use axum::extract::Request;
use axum::http::header::USER_AGENT;
use axum::middleware::Next;
use axum::response::Response;
use serde::Serialize;
use tracing_subscriber::{fmt, EnvFilter};

/// Log severity graded from an HTTP status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warn,
    Error,
}

impl Severity {
    pub fn from_status(status: u16) -> Self {
        if status < 400 {
            Severity::Info
        } else if status < 500 {
            Severity::Warn
        } else {
            Severity::Error
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
        }
    }
}

/// One finished request as seen by the access log.
#[derive(Debug, Clone)]
pub struct AccessRecord {
    pub status: u16,
    pub method: String,
    pub url: String,
    pub response_time_ms: f64,
    pub user_agent: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AccessLine<'a> {
    level: Severity,
    method: &'a str,
    url: &'a str,
    status_code: u16,
    response_time: String,
    user_agent: Option<&'a str>,
}

impl AccessRecord {
    /// Emit the record as an event whose fields match the keys of
    /// [`format_access_record`]. With the flattened JSON subscriber they
    /// end up at the top level of the line.
    pub fn emit(&self) {
        let response_time = format!("{:.3}", self.response_time_ms);
        let user_agent = self.user_agent.as_deref();
        match Severity::from_status(self.status) {
            Severity::Info => tracing::info!(
                target: "kitsas_addon::access",
                method = %self.method,
                url = %self.url,
                statusCode = self.status,
                responseTime = %response_time,
                userAgent = user_agent,
                "request completed"
            ),
            Severity::Warn => tracing::warn!(
                target: "kitsas_addon::access",
                method = %self.method,
                url = %self.url,
                statusCode = self.status,
                responseTime = %response_time,
                userAgent = user_agent,
                "request completed"
            ),
            Severity::Error => tracing::error!(
                target: "kitsas_addon::access",
                method = %self.method,
                url = %self.url,
                statusCode = self.status,
                responseTime = %response_time,
                userAgent = user_agent,
                "request completed"
            ),
        }
    }
}

/// Render an access record as a single JSON line.
pub fn format_access_record(record: &AccessRecord) -> String {
    let line = AccessLine {
        level: Severity::from_status(record.status),
        method: &record.method,
        url: &record.url,
        status_code: record.status,
        response_time: format!("{:.3}", record.response_time_ms),
        user_agent: record.user_agent.as_deref(),
    };
    serde_json::to_string(&line).unwrap_or_default()
}

/// Middleware writing one access line per request at the severity of its
/// status code.
pub async fn access_log(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().to_string();
    let url = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| req.uri().path().to_owned());
    let user_agent = req
        .headers()
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let response = next.run(req).await;

    let record = AccessRecord {
        status: response.status().as_u16(),
        method,
        url,
        response_time_ms: start.elapsed().as_secs_f64() * 1000.0,
        user_agent,
    };
    record.emit();
    response
}

/// Install a single-line JSON subscriber filtered by `RUST_LOG` (default
/// `info`). Safe to call more than once; later calls are ignored.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .json()
        .flatten_event(true)
        .with_current_span(false)
        .with_env_filter(filter)
        .try_init();
}
