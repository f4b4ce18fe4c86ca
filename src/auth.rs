//! Call authentication for protected routers.
//!
//! Kitsas opens an addon with `?callId=...`. The first request exchanges
//! the id for the caller context and stores it in the session; later
//! requests without a call id are trusted on the strength of the session.

use axum::extract::{Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;
use serde::Deserialize;

use crate::call::DEFAULT_LANGUAGE;
use crate::session::{self, Session, SessionRecord};
use crate::AddonState;

pub const MISSING_CALL_MESSAGE: &str =
    "This is a Kitsas addon and should be called from Kitsas with valid Call ID.";
pub const INVALID_CALL_MESSAGE: &str = "Call ID not valid.";

#[derive(Debug, Default, Deserialize)]
pub struct CallQuery {
    #[serde(rename = "callId")]
    pub call_id: Option<String>,
    pub language: Option<String>,
}

pub async fn authenticate(
    State(state): State<AddonState>,
    session: Session,
    query: Option<Query<CallQuery>>,
    req: Request,
    next: Next,
) -> Response {
    let query = query.map(|Query(q)| q).unwrap_or_default();
    let call_id = query.call_id.filter(|id| !id.is_empty());

    let mut record = match session::load_record(&session).await {
        Ok(record) => record,
        Err(err) => {
            tracing::warn!(error = %err, "session record unreadable, starting empty");
            SessionRecord::default()
        }
    };

    let Some(call_id) = call_id else {
        if record.call.is_some() {
            return next.run(req).await;
        }
        return state.views().respond(
            StatusCode::BAD_REQUEST,
            "error",
            Some(MISSING_CALL_MESSAGE),
            MISSING_CALL_MESSAGE,
        );
    };

    let Some(connection) = state.connection() else {
        tracing::error!("call authentication reached before Kitsas connection was ready");
        return state.unready_response();
    };

    match connection.call_info(&call_id).await {
        Ok(call) => {
            let language = query
                .language
                .filter(|l| !l.is_empty())
                .unwrap_or_else(|| DEFAULT_LANGUAGE.to_owned());
            if record.call_id.as_deref() != Some(call_id.as_str()) {
                record.data.clear();
            }
            record.call_id = Some(call_id);
            record.call = Some(call);
            record.language = Some(language);
            if let Err(err) = session::store_record(&session, &record).await {
                tracing::warn!(error = %err, "failed to persist authenticated session");
            }
            next.run(req).await
        }
        Err(err) => {
            tracing::warn!(error = %err, "call id rejected by Kitsas");
            state.views().respond(
                StatusCode::INTERNAL_SERVER_ERROR,
                "error",
                Some(INVALID_CALL_MESSAGE),
                INVALID_CALL_MESSAGE,
            )
        }
    }
}
