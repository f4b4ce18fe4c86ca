//! Error types shared across the addon runtime.

use thiserror::Error;

/// Failures talking to the Kitsas server.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// No connection has been established yet.
    #[error("Kitsas connection not available")]
    NotReady,
    #[error("Kitsas request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Kitsas responded with status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("invalid response from Kitsas: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("Kitsas login rejected: {0}")]
    Login(String),
    #[error("invalid Kitsas url: {0}")]
    InvalidUrl(String),
}

/// Failures loading or persisting session records.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session store error: {0}")]
    Store(String),
    #[error("session serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("session error: {0}")]
    Session(#[from] tower_sessions::session::Error),
}

impl From<fred::error::Error> for SessionError {
    fn from(err: fred::error::Error) -> Self {
        SessionError::Store(err.to_string())
    }
}

/// Errors surfaced by [`crate::KitsasAddon::start`].
#[derive(Debug, Error)]
pub enum AddonError {
    #[error("invalid configuration: {0}")]
    Config(#[from] anyhow::Error),
    #[error("server error: {0}")]
    Io(#[from] std::io::Error),
}
