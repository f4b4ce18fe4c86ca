use std::time::Duration;

use fred::prelude::*;
use tower_sessions::session::{Id, Record};
use tower_sessions::session_store::{self, SessionStore};

use crate::error::SessionError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Session store backed by Redis. Records are JSON strings under
/// `<prefix>:<session id>` and expire at the record's expiry date.
#[derive(Debug, Clone)]
pub struct RedisSessionStore {
    client: Client,
    prefix: String,
}

fn backend(err: fred::error::Error) -> session_store::Error {
    session_store::Error::Backend(err.to_string())
}

impl RedisSessionStore {
    /// Connect and verify the server accepts writes under the prefix.
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, SessionError> {
        let config = Config::from_url(url)?;
        let client = Client::new(
            config,
            None,
            None,
            Some(ReconnectPolicy::new_exponential(0, 1000, 30_000, 2)),
        );
        match tokio::time::timeout(CONNECT_TIMEOUT, client.init()).await {
            Ok(result) => {
                result?;
            }
            Err(_) => {
                let _ = client.quit().await;
                return Err(SessionError::Store(format!(
                    "timed out connecting to {}",
                    url
                )));
            }
        }

        let store = Self {
            client,
            prefix: format!("{}:", prefix),
        };
        store
            .client
            .set::<(), _, _>(
                store.key("test"),
                "test",
                Some(Expiration::EX(10)),
                None,
                false,
            )
            .await?;
        Ok(store)
    }

    fn key(&self, id: impl std::fmt::Display) -> String {
        format!("{}{}", self.prefix, id)
    }
}

#[async_trait::async_trait]
impl SessionStore for RedisSessionStore {
    async fn save(&self, record: &Record) -> session_store::Result<()> {
        let serialized = serde_json::to_string(record)
            .map_err(|err| session_store::Error::Encode(err.to_string()))?;
        self.client
            .set::<(), _, _>(
                self.key(record.id),
                serialized,
                Some(Expiration::EXAT(record.expiry_date.unix_timestamp())),
                None,
                false,
            )
            .await
            .map_err(backend)
    }

    async fn load(&self, session_id: &Id) -> session_store::Result<Option<Record>> {
        let value: Option<String> = self
            .client
            .get(self.key(session_id))
            .await
            .map_err(backend)?;
        value
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(|err| session_store::Error::Decode(err.to_string()))
    }

    async fn delete(&self, session_id: &Id) -> session_store::Result<()> {
        self.client
            .del::<(), _>(self.key(session_id))
            .await
            .map_err(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn rejects_malformed_url() {
        let err = RedisSessionStore::connect("not a url", "SESSION").await.err();
        assert!(matches!(err, Some(SessionError::Store(_))));
    }

    #[tokio::test]
    async fn unreachable_server_fails_to_connect() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let url = format!("redis://127.0.0.1:{}", port);
        assert!(RedisSessionStore::connect(&url, "SESSION").await.is_err());
    }
}
