//! Request-scoped access to the caller's context.
//!
//! Handlers usually take an [`AddonCall`] as their first extractor and use
//! it to read who is calling and to talk to Kitsas on behalf of the
//! caller's organization.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::connection::{
    AddonLogEntry, Book, KitsasConnection, LanguageString, LogStatus, NewNotification,
    Notification, NotificationType,
};
use crate::error::{ConnectionError, SessionError};
use crate::session::{self, CallInfo, Session, SessionRecord};
use crate::AddonState;

pub const DEFAULT_LANGUAGE: &str = "fi";

#[derive(Clone)]
pub struct AddonCall {
    session: Session,
    record: Arc<Mutex<SessionRecord>>,
    state: AddonState,
}

impl AddonCall {
    pub fn new(session: Session, record: SessionRecord, state: AddonState) -> Self {
        Self {
            session,
            record: Arc::new(Mutex::new(record)),
            state,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    fn record(&self) -> MutexGuard<'_, SessionRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connection to Kitsas, available once the addon is ready.
    pub fn connection(&self) -> Result<Arc<dyn KitsasConnection>, ConnectionError> {
        self.state.require_connection()
    }

    fn with_call<R: Default>(&self, f: impl FnOnce(&CallInfo) -> R) -> R {
        self.record().call.as_ref().map(f).unwrap_or_default()
    }

    pub fn call_info(&self) -> Option<CallInfo> {
        self.record().call.clone()
    }

    pub fn call_id(&self) -> String {
        self.record().call_id.clone().unwrap_or_default()
    }

    pub fn user_name(&self) -> String {
        self.with_call(|c| c.user.name.clone())
    }

    pub fn user_id(&self) -> String {
        self.with_call(|c| c.user.id.clone())
    }

    pub fn organization_name(&self) -> String {
        self.with_call(|c| c.organization.name.clone())
    }

    pub fn organization_id(&self) -> String {
        self.with_call(|c| c.organization.id.clone())
    }

    pub fn business_id(&self) -> String {
        self.with_call(|c| c.organization.business_id.clone().unwrap_or_default())
    }

    pub fn office_id(&self) -> String {
        self.with_call(|c| c.office.as_ref().map(|o| o.id.clone()).unwrap_or_default())
    }

    pub fn office_name(&self) -> String {
        self.with_call(|c| c.office.as_ref().map(|o| o.name.clone()).unwrap_or_default())
    }

    pub fn office_business_id(&self) -> String {
        self.with_call(|c| {
            c.office
                .as_ref()
                .and_then(|o| o.business_id.clone())
                .unwrap_or_default()
        })
    }

    pub fn rights(&self) -> Vec<String> {
        self.with_call(|c| c.rights.clone())
    }

    /// True when Kitsas granted the addon any rights for this call.
    pub fn is_active(&self) -> bool {
        self.with_call(|c| !c.rights.is_empty())
    }

    /// Caller fields for structured log records.
    pub fn log_info(&self) -> serde_json::Value {
        serde_json::json!({
            "user": self.user_name(),
            "userId": self.user_id(),
            "organization": self.organization_name(),
            "organizationId": self.organization_id(),
        })
    }

    /// Value stored in the session data bag.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.record().data.get(key).cloned()
    }

    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| serde_json::from_value(v).ok())
    }

    /// Store a value in the session data bag. The bag is copied, updated
    /// and written back; concurrent requests of the same session race and
    /// the last write wins.
    pub async fn set<T: Serialize>(&self, key: &str, value: T) -> Result<(), SessionError> {
        let value = serde_json::to_value(value)?;
        let updated = {
            let mut record = self.record();
            let mut data = record.data.clone();
            data.insert(key.to_owned(), value);
            record.data = data;
            record.clone()
        };
        session::store_record(&self.session, &updated).await
    }

    pub fn language(&self) -> String {
        self.record()
            .language
            .clone()
            .unwrap_or_else(|| DEFAULT_LANGUAGE.to_owned())
    }

    pub fn base_url(&self) -> &str {
        self.state.base_url()
    }

    pub async fn log(
        &self,
        status: LogStatus,
        message: &str,
        data: Option<serde_json::Value>,
    ) -> Result<(), ConnectionError> {
        self.connection()?
            .write_addon_log(&self.organization_id(), status, message, data)
            .await
    }

    pub async fn logs(&self) -> Result<Vec<AddonLogEntry>, ConnectionError> {
        self.connection()?.addon_log(&self.organization_id()).await
    }

    /// Persist a keyed data object on the Kitsas server.
    pub async fn save_data(&self, key: &str, data: &serde_json::Value) -> Result<(), ConnectionError> {
        self.connection()?
            .save_data(&self.organization_id(), key, data)
            .await
    }

    pub async fn data(&self, key: &str) -> Result<serde_json::Value, ConnectionError> {
        self.connection()?.data(&self.organization_id(), key).await
    }

    pub async fn notify(
        &self,
        kind: NotificationType,
        title: LanguageString,
        text: LanguageString,
        category: Option<String>,
    ) -> Result<(), ConnectionError> {
        let notification = NewNotification {
            kind,
            title,
            text,
            category,
        };
        self.connection()?
            .add_notification(&self.organization_id(), &notification)
            .await
    }

    pub async fn replace_notification(
        &self,
        kind: NotificationType,
        title: LanguageString,
        text: LanguageString,
        category: Option<String>,
    ) -> Result<(), ConnectionError> {
        let notification = NewNotification {
            kind,
            title,
            text,
            category,
        };
        self.connection()?
            .replace_notification(&self.organization_id(), &notification)
            .await
    }

    pub async fn notifications(&self) -> Result<Vec<Notification>, ConnectionError> {
        self.connection()?
            .notifications(&self.organization_id())
            .await
    }

    pub async fn delete_notification(&self, notification_id: &str) -> Result<(), ConnectionError> {
        self.connection()?
            .delete_notification(&self.organization_id(), notification_id)
            .await
    }

    pub async fn book(&self) -> Result<Book, ConnectionError> {
        self.connection()?.book(&self.organization_id()).await
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for AddonCall
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let session = Session::from_request_parts(parts, state).await?;
        let record = session::load_record(&session).await.map_err(|err| {
            tracing::warn!(error = %err, "session record could not be loaded");
            (StatusCode::INTERNAL_SERVER_ERROR, "Session could not be loaded")
        })?;
        let addon = parts.extensions.get::<AddonState>().cloned().ok_or((
            StatusCode::INTERNAL_SERVER_ERROR,
            "Addon state is not installed",
        ))?;
        Ok(Self::new(session, record, addon))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AddonConfig, AddonOptions};
    use crate::session::{CallOffice, CallOrganization, CallUser, MemorySessionStore};

    fn state() -> AddonState {
        let cfg = AddonConfig::from_options(
            AddonOptions::default()
                .port(3210)
                .session_secret("test")
                .base_url("https://addon.test"),
        )
        .unwrap();
        AddonState::new(cfg)
    }

    fn session() -> Session {
        Session::new(None, Arc::new(MemorySessionStore::new()), None)
    }

    fn sample_call(rights: Vec<String>) -> CallInfo {
        CallInfo {
            user: CallUser {
                id: "u1".into(),
                name: "Maija".into(),
            },
            organization: CallOrganization {
                id: "o1".into(),
                name: "Demo Oy".into(),
                business_id: Some("1234567-8".into()),
            },
            office: Some(CallOffice {
                id: "t1".into(),
                name: "Tilitoimisto".into(),
                business_id: None,
            }),
            rights,
        }
    }

    fn call_with(record: SessionRecord) -> AddonCall {
        AddonCall::new(session(), record, state())
    }

    #[test]
    fn getters_degrade_without_call() {
        let call = call_with(SessionRecord::default());
        assert_eq!(call.user_name(), "");
        assert_eq!(call.user_id(), "");
        assert_eq!(call.organization_name(), "");
        assert_eq!(call.organization_id(), "");
        assert_eq!(call.business_id(), "");
        assert_eq!(call.office_id(), "");
        assert_eq!(call.office_name(), "");
        assert_eq!(call.office_business_id(), "");
        assert!(call.rights().is_empty());
        assert!(!call.is_active());
        assert_eq!(call.language(), "fi");
        assert_eq!(call.base_url(), "https://addon.test");
    }

    #[test]
    fn getters_read_session_call() {
        let call = call_with(SessionRecord {
            call: Some(sample_call(vec!["addon".into()])),
            language: Some("sv".into()),
            ..SessionRecord::default()
        });
        assert_eq!(call.user_name(), "Maija");
        assert_eq!(call.organization_id(), "o1");
        assert_eq!(call.business_id(), "1234567-8");
        assert_eq!(call.office_name(), "Tilitoimisto");
        assert_eq!(call.office_business_id(), "");
        assert!(call.is_active());
        assert_eq!(call.language(), "sv");
        assert_eq!(call.log_info()["organization"], "Demo Oy");
    }

    #[test]
    fn empty_rights_is_inactive() {
        let call = call_with(SessionRecord {
            call: Some(sample_call(Vec::new())),
            ..SessionRecord::default()
        });
        assert!(!call.is_active());
    }

    #[tokio::test]
    async fn data_bag_get_and_set() {
        let call = call_with(SessionRecord::default());
        assert!(call.get("counter").is_none());
        call.set("counter", 3).await.unwrap();
        call.set("name", "x").await.unwrap();
        assert_eq!(call.get_as::<i32>("counter"), Some(3));
        assert_eq!(call.get("name"), Some(serde_json::json!("x")));

        let stored = session::load_record(call.session()).await.unwrap();
        assert_eq!(stored.data.get("counter"), Some(&serde_json::json!(3)));
        assert_eq!(stored.data.len(), 2);
    }

    #[tokio::test]
    async fn delegated_calls_fail_when_not_ready() {
        let call = call_with(SessionRecord::default());
        let err = call.logs().await.unwrap_err();
        assert!(matches!(err, ConnectionError::NotReady));
    }
}
