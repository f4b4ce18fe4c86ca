//! Connection to the Kitsas server.
//!
//! The addon only ever talks to Kitsas through the [`KitsasConnection`]
//! trait. A [`Connector`] produces a connection at startup; the default
//! [`HttpConnector`] speaks JSON over HTTP, tests and embedders can plug in
//! their own.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ConnectionConfig;
use crate::error::ConnectionError;
use crate::session::CallInfo;

pub mod http;

pub use self::http::{HttpConnection, HttpConnector};

/// Text keyed by language code (`fi`, `sv`, `en`).
pub type LanguageString = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogStatus {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NotificationType {
    Info,
    Success,
    Warning,
    Error,
}

/// Entry of the per-organization addon log kept by Kitsas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddonLogEntry {
    #[serde(default)]
    pub id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub status: LogStatus,
    pub message: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// Notification payload sent when adding or replacing a notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewNotification {
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub title: LanguageString,
    pub text: LanguageString,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub title: LanguageString,
    pub text: LanguageString,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
}

/// Handle to an organization's book. Only identifying fields are typed;
/// the rest of the server's description is kept as-is in `details`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Book {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub business_id: Option<String>,
    #[serde(flatten)]
    pub details: serde_json::Map<String, serde_json::Value>,
}

/// Operations the addon performs against Kitsas. All organization scoped
/// calls take the organization id resolved from the caller's session.
#[async_trait::async_trait]
pub trait KitsasConnection: Send + Sync {
    /// Name reported by the Kitsas service at connect time.
    fn name(&self) -> String;

    /// Resolve a call identifier into the caller context.
    async fn call_info(&self, call_id: &str) -> Result<CallInfo, ConnectionError>;

    async fn write_addon_log(
        &self,
        organization_id: &str,
        status: LogStatus,
        message: &str,
        data: Option<serde_json::Value>,
    ) -> Result<(), ConnectionError>;

    async fn addon_log(&self, organization_id: &str) -> Result<Vec<AddonLogEntry>, ConnectionError>;

    async fn save_data(
        &self,
        organization_id: &str,
        key: &str,
        data: &serde_json::Value,
    ) -> Result<(), ConnectionError>;

    async fn data(&self, organization_id: &str, key: &str)
        -> Result<serde_json::Value, ConnectionError>;

    async fn add_notification(
        &self,
        organization_id: &str,
        notification: &NewNotification,
    ) -> Result<(), ConnectionError>;

    /// Add a notification, replacing an existing one of the same type and
    /// category.
    async fn replace_notification(
        &self,
        organization_id: &str,
        notification: &NewNotification,
    ) -> Result<(), ConnectionError>;

    async fn notifications(&self, organization_id: &str)
        -> Result<Vec<Notification>, ConnectionError>;

    async fn delete_notification(
        &self,
        organization_id: &str,
        notification_id: &str,
    ) -> Result<(), ConnectionError>;

    async fn book(&self, organization_id: &str) -> Result<Book, ConnectionError>;
}

/// Establishes a [`KitsasConnection`]. Called by the addon's background
/// connect task until it succeeds.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Arc<dyn KitsasConnection>, ConnectionError>;
}
