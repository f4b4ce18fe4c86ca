#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::http::Response;
use http_body_util::BodyExt;
use kitsas_addon::session::{CallOrganization, CallUser};
use kitsas_addon::{
    AddonConfig, AddonLogEntry, AddonOptions, Book, CallInfo, ConnectionConfig, ConnectionError,
    Connector, KitsasAddon, KitsasConnection, LogStatus, MemorySessionStore, NewNotification,
    Notification,
};

/// Tracks environment variable mutations and restores originals on drop.
pub struct EnvGuard {
    originals: HashMap<String, Option<String>>,
}

impl EnvGuard {
    pub fn new() -> Self {
        Self {
            originals: HashMap::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.capture(key);
        std::env::set_var(key, value);
    }

    pub fn remove(&mut self, key: &str) {
        self.capture(key);
        std::env::remove_var(key);
    }

    fn capture(&mut self, key: &str) {
        if self.originals.contains_key(key) {
            return;
        }
        let original = std::env::var(key).ok();
        self.originals.insert(key.to_string(), original);
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, original) in self.originals.drain() {
            match original {
                Some(value) => std::env::set_var(&key, value),
                None => std::env::remove_var(&key),
            }
        }
    }
}

pub const VALID_CALL: &str = "valid-call";
pub const OTHER_CALL: &str = "other-call";

pub fn call_info(org: &str) -> CallInfo {
    CallInfo {
        user: CallUser {
            id: "u1".into(),
            name: "Maija Meikäläinen".into(),
        },
        organization: CallOrganization {
            id: org.into(),
            name: format!("{} Oy", org),
            business_id: Some("1234567-8".into()),
        },
        office: None,
        rights: vec!["addon".into()],
    }
}

/// In-memory Kitsas double. Knows two call ids and records every write.
#[derive(Default)]
pub struct MockConnection {
    pub writes: Mutex<Vec<String>>,
}

impl MockConnection {
    pub fn writes(&self) -> Vec<String> {
        self.writes.lock().unwrap().clone()
    }

    fn record(&self, entry: String) {
        self.writes.lock().unwrap().push(entry);
    }
}

#[async_trait::async_trait]
impl KitsasConnection for MockConnection {
    fn name(&self) -> String {
        "mock".into()
    }

    async fn call_info(&self, call_id: &str) -> Result<CallInfo, ConnectionError> {
        match call_id {
            VALID_CALL => Ok(call_info("org-1")),
            OTHER_CALL => Ok(call_info("org-2")),
            _ => Err(ConnectionError::Status {
                status: 404,
                message: "unknown call".into(),
            }),
        }
    }

    async fn write_addon_log(
        &self,
        organization_id: &str,
        status: LogStatus,
        message: &str,
        _data: Option<serde_json::Value>,
    ) -> Result<(), ConnectionError> {
        self.record(format!("log:{}:{:?}:{}", organization_id, status, message));
        Ok(())
    }

    async fn addon_log(&self, _organization_id: &str) -> Result<Vec<AddonLogEntry>, ConnectionError> {
        Ok(Vec::new())
    }

    async fn save_data(
        &self,
        organization_id: &str,
        key: &str,
        data: &serde_json::Value,
    ) -> Result<(), ConnectionError> {
        self.record(format!("data:{}:{}:{}", organization_id, key, data));
        Ok(())
    }

    async fn data(&self, _organization_id: &str, key: &str) -> Result<serde_json::Value, ConnectionError> {
        Ok(serde_json::json!({ "key": key }))
    }

    async fn add_notification(
        &self,
        organization_id: &str,
        notification: &NewNotification,
    ) -> Result<(), ConnectionError> {
        self.record(format!("notify:{}:{:?}", organization_id, notification.kind));
        Ok(())
    }

    async fn replace_notification(
        &self,
        organization_id: &str,
        notification: &NewNotification,
    ) -> Result<(), ConnectionError> {
        self.record(format!("replace:{}:{:?}", organization_id, notification.kind));
        Ok(())
    }

    async fn notifications(&self, _organization_id: &str) -> Result<Vec<Notification>, ConnectionError> {
        Ok(Vec::new())
    }

    async fn delete_notification(
        &self,
        organization_id: &str,
        notification_id: &str,
    ) -> Result<(), ConnectionError> {
        self.record(format!("delete:{}:{}", organization_id, notification_id));
        Ok(())
    }

    async fn book(&self, organization_id: &str) -> Result<Book, ConnectionError> {
        Ok(Book {
            id: organization_id.into(),
            name: "Demo".into(),
            business_id: None,
            details: serde_json::Map::new(),
        })
    }
}

/// Connector failing its first `failures` attempts.
pub struct FlakyConnector {
    pub failures: u32,
    pub attempts: Arc<AtomicU32>,
    pub connection: Arc<MockConnection>,
}

impl FlakyConnector {
    pub fn new(failures: u32) -> Self {
        Self {
            failures,
            attempts: Arc::new(AtomicU32::new(0)),
            connection: Arc::new(MockConnection::default()),
        }
    }
}

#[async_trait::async_trait]
impl Connector for FlakyConnector {
    async fn connect(
        &self,
        _config: &ConnectionConfig,
    ) -> Result<Arc<dyn KitsasConnection>, ConnectionError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.failures {
            return Err(ConnectionError::Login("not yet".into()));
        }
        Ok(self.connection.clone())
    }
}

pub fn test_config() -> AddonConfig {
    AddonConfig::from_options(
        AddonOptions::default()
            .app_name("TestAddon")
            .session_secret("test-secret")
            .views_path("/nonexistent/views"),
    )
    .unwrap()
}

/// Addon with an in-memory session store.
pub fn test_addon() -> KitsasAddon {
    KitsasAddon::with_config(test_config())
        .with_session_store(MemorySessionStore::new())
}

/// Mark the addon ready with a fresh mock connection.
pub fn make_ready(addon: &KitsasAddon) -> Arc<MockConnection> {
    let connection = Arc::new(MockConnection::default());
    addon.state().install_connection(connection.clone());
    connection
}

pub async fn body_string(resp: Response<Body>) -> String {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// `name=value` part of the session cookie set by `resp`.
pub fn session_cookie(resp: &Response<Body>) -> Option<String> {
    resp.headers()
        .get_all("set-cookie")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find(|v| v.starts_with("kitsas.sid="))
        .and_then(|v| v.split(';').next())
        .map(str::to_owned)
}

pub async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
