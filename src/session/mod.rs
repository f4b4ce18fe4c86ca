//! Per-browser session state.
//!
//! Sessions are managed by `tower-sessions`: the layer built in
//! [`crate::KitsasAddon::into_app`] issues the signed `kitsas.sid` cookie
//! and saves the session after each response. The addon keeps its whole
//! state as one [`SessionRecord`] under [`RECORD_KEY`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use tower_sessions::cookie::Key;
use tower_sessions::session::{Id, Record};
use tower_sessions::session_store::{self, SessionStore};
use tower_sessions::Expiry;

use crate::error::SessionError;

pub mod redis;
pub mod store;

pub use self::redis::RedisSessionStore;
pub use self::store::MemorySessionStore;
pub use tower_sessions::Session;

pub const SESSION_COOKIE: &str = "kitsas.sid";
/// Session key holding the serialized [`SessionRecord`].
pub const RECORD_KEY: &str = "kitsas";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallUser {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallOrganization {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub business_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallOffice {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub business_id: Option<String>,
}

/// Caller context Kitsas returns for a call identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallInfo {
    #[serde(default)]
    pub user: CallUser,
    #[serde(default)]
    pub organization: CallOrganization,
    #[serde(default)]
    pub office: Option<CallOffice>,
    /// Capabilities granted to the addon for this call.
    #[serde(default)]
    pub rights: Vec<String>,
}

/// Persisted per-session state.
///
/// `data` is private to the addon. Nothing enforces a schema on it, so
/// addons should namespace their keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call: Option<CallInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
}

/// Current record of `session`; empty when nothing was stored yet.
pub async fn load_record(session: &Session) -> Result<SessionRecord, SessionError> {
    Ok(session
        .get::<SessionRecord>(RECORD_KEY)
        .await?
        .unwrap_or_default())
}

/// Replace the record of `session`. Written to the store after the response.
pub async fn store_record(session: &Session, record: &SessionRecord) -> Result<(), SessionError> {
    session.insert(RECORD_KEY, record).await?;
    Ok(())
}

/// Cookie signing key derived from the session secret. SHA-512 gives the
/// 64 bytes the key needs whatever the secret length.
pub fn signing_key(secret: &str) -> Key {
    Key::from(Sha512::digest(secret.as_bytes()).as_slice())
}

/// Sessions expire after `ttl` without requests.
pub fn inactivity_expiry(ttl: Duration) -> Expiry {
    let secs = i64::try_from(ttl.as_secs().max(1)).unwrap_or(i64::MAX);
    Expiry::OnInactivity(time::Duration::seconds(secs))
}

/// Store chosen at startup: Redis when reachable, memory otherwise.
#[derive(Debug, Clone)]
pub enum SessionBackend {
    Memory(MemorySessionStore),
    Redis(RedisSessionStore),
}

impl From<MemorySessionStore> for SessionBackend {
    fn from(store: MemorySessionStore) -> Self {
        SessionBackend::Memory(store)
    }
}

impl From<RedisSessionStore> for SessionBackend {
    fn from(store: RedisSessionStore) -> Self {
        SessionBackend::Redis(store)
    }
}

#[async_trait::async_trait]
impl SessionStore for SessionBackend {
    async fn save(&self, record: &Record) -> session_store::Result<()> {
        match self {
            SessionBackend::Memory(store) => store.save(record).await,
            SessionBackend::Redis(store) => store.save(record).await,
        }
    }

    async fn load(&self, session_id: &Id) -> session_store::Result<Option<Record>> {
        match self {
            SessionBackend::Memory(store) => store.load(session_id).await,
            SessionBackend::Redis(store) => store.load(session_id).await,
        }
    }

    async fn delete(&self, session_id: &Id) -> session_store::Result<()> {
        match self {
            SessionBackend::Memory(store) => store.delete(session_id).await,
            SessionBackend::Redis(store) => store.delete(session_id).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn session() -> Session {
        Session::new(None, Arc::new(MemorySessionStore::new()), None)
    }

    #[test]
    fn record_serializes_camel_case() {
        let record = SessionRecord {
            call: None,
            language: Some("sv".into()),
            call_id: Some("c1".into()),
            data: serde_json::Map::new(),
        };
        let v = serde_json::to_value(&record).unwrap();
        assert_eq!(v, json!({"language": "sv", "callId": "c1", "data": {}}));
        let back: SessionRecord = serde_json::from_value(v).unwrap();
        assert_eq!(back, record);
    }

    #[tokio::test]
    async fn record_round_trips_through_session() {
        let session = session();
        assert_eq!(load_record(&session).await.unwrap(), SessionRecord::default());

        let mut record = SessionRecord {
            language: Some("en".into()),
            ..SessionRecord::default()
        };
        record.data.insert("step".into(), json!(2));
        store_record(&session, &record).await.unwrap();
        assert_eq!(load_record(&session).await.unwrap(), record);
    }

    #[test]
    fn short_secrets_still_make_a_key() {
        let a = signing_key("x");
        let b = signing_key("y");
        assert_ne!(a.master(), b.master());
        assert_eq!(signing_key("x").master(), a.master());
    }

    #[test]
    fn expiry_tracks_inactivity() {
        match inactivity_expiry(Duration::from_secs(600)) {
            Expiry::OnInactivity(d) => assert_eq!(d.whole_seconds(), 600),
            other => panic!("unexpected expiry {:?}", other),
        }
    }
}
