use std::sync::Arc;

use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{
    AddonLogEntry, Book, Connector, KitsasConnection, LogStatus, NewNotification, Notification,
};
use crate::config::ConnectionConfig;
use crate::error::ConnectionError;
use crate::session::CallInfo;

/// Connects to Kitsas over HTTP by logging in with the configured
/// credentials.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpConnector;

#[async_trait::async_trait]
impl Connector for HttpConnector {
    async fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Arc<dyn KitsasConnection>, ConnectionError> {
        let connection = HttpConnection::login(config).await?;
        Ok(Arc::new(connection))
    }
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    token: String,
    #[serde(default)]
    name: String,
}

#[derive(Serialize)]
struct LogRequest<'a> {
    status: LogStatus,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
}

/// Bearer-authenticated JSON client for the Kitsas addon API.
pub struct HttpConnection {
    client: reqwest::Client,
    base: Url,
    token: String,
    name: String,
}

impl HttpConnection {
    pub async fn login(config: &ConnectionConfig) -> Result<Self, ConnectionError> {
        let (username, password) = match (&config.username, &config.password) {
            (Some(u), Some(p)) => (u.as_str(), p.as_str()),
            _ => {
                return Err(ConnectionError::Login(
                    "KITSAS_USERNAME and KITSAS_PASSWORD must be set".into(),
                ))
            }
        };
        let base = Url::parse(&config.url).map_err(|e| ConnectionError::InvalidUrl(e.to_string()))?;
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;

        let url = join(&base, &["v1", "login"])?;
        let resp = client
            .post(url)
            .json(&LoginRequest { username, password })
            .send()
            .await?;
        if resp.status() == StatusCode::UNAUTHORIZED || resp.status() == StatusCode::FORBIDDEN {
            return Err(ConnectionError::Login(format!(
                "credentials for '{}' were rejected",
                username
            )));
        }
        let login: LoginResponse = decode(resp).await?;
        tracing::debug!(url = %config.url, "logged in to Kitsas");
        Ok(Self {
            client,
            base,
            token: login.token,
            name: login.name,
        })
    }

    async fn request<B: Serialize + ?Sized>(
        &self,
        method: Method,
        segments: &[&str],
        body: Option<&B>,
    ) -> Result<reqwest::Response, ConnectionError> {
        let url = join(&self.base, segments)?;
        let mut rb = self.client.request(method, url).bearer_auth(&self.token);
        if let Some(body) = body {
            rb = rb.json(body);
        }
        Ok(rb.send().await?)
    }

    async fn get_json<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T, ConnectionError> {
        let resp = self.request::<()>(Method::GET, segments, None).await?;
        decode(resp).await
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        segments: &[&str],
        body: Option<&B>,
    ) -> Result<(), ConnectionError> {
        let resp = self.request(method, segments, body).await?;
        check(resp).await.map(|_| ())
    }
}

fn join(base: &Url, segments: &[&str]) -> Result<Url, ConnectionError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| ConnectionError::InvalidUrl(base.to_string()))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

async fn check(resp: reqwest::Response) -> Result<reqwest::Response, ConnectionError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp.text().await.unwrap_or_default();
    Err(ConnectionError::Status {
        status: status.as_u16(),
        message,
    })
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ConnectionError> {
    let resp = check(resp).await?;
    let text = resp.text().await?;
    Ok(serde_json::from_str(&text)?)
}

#[async_trait::async_trait]
impl KitsasConnection for HttpConnection {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn call_info(&self, call_id: &str) -> Result<CallInfo, ConnectionError> {
        self.get_json(&["v1", "addons", "calls", call_id]).await
    }

    async fn write_addon_log(
        &self,
        organization_id: &str,
        status: LogStatus,
        message: &str,
        data: Option<serde_json::Value>,
    ) -> Result<(), ConnectionError> {
        let body = LogRequest {
            status,
            message,
            data,
        };
        self.send(Method::POST, &["v1", "addons", organization_id, "log"], Some(&body))
            .await
    }

    async fn addon_log(&self, organization_id: &str) -> Result<Vec<AddonLogEntry>, ConnectionError> {
        self.get_json(&["v1", "addons", organization_id, "log"]).await
    }

    async fn save_data(
        &self,
        organization_id: &str,
        key: &str,
        data: &serde_json::Value,
    ) -> Result<(), ConnectionError> {
        self.send(
            Method::PUT,
            &["v1", "addons", organization_id, "data", key],
            Some(data),
        )
        .await
    }

    async fn data(
        &self,
        organization_id: &str,
        key: &str,
    ) -> Result<serde_json::Value, ConnectionError> {
        self.get_json(&["v1", "addons", organization_id, "data", key])
            .await
    }

    async fn add_notification(
        &self,
        organization_id: &str,
        notification: &NewNotification,
    ) -> Result<(), ConnectionError> {
        self.send(
            Method::POST,
            &["v1", "addons", organization_id, "notifications"],
            Some(notification),
        )
        .await
    }

    async fn replace_notification(
        &self,
        organization_id: &str,
        notification: &NewNotification,
    ) -> Result<(), ConnectionError> {
        self.send(
            Method::PUT,
            &["v1", "addons", organization_id, "notifications"],
            Some(notification),
        )
        .await
    }

    async fn notifications(
        &self,
        organization_id: &str,
    ) -> Result<Vec<Notification>, ConnectionError> {
        self.get_json(&["v1", "addons", organization_id, "notifications"])
            .await
    }

    async fn delete_notification(
        &self,
        organization_id: &str,
        notification_id: &str,
    ) -> Result<(), ConnectionError> {
        self.send::<()>(
            Method::DELETE,
            &["v1", "addons", organization_id, "notifications", notification_id],
            None,
        )
        .await
    }

    async fn book(&self, organization_id: &str) -> Result<Book, ConnectionError> {
        self.get_json(&["v1", "books", organization_id]).await
    }
}
