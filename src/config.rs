use std::env;
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::util::random_secret;

const DEFAULT_APP_NAME: &str = "Addon";
const DEFAULT_PORT: u16 = 3210;
const DEFAULT_KITSAS_URL: &str = "http://localhost:5000";
const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";
const DEFAULT_SESSION_PREFIX: &str = "SESSION";
const DEFAULT_SESSION_TTL_SECS: u64 = 86_400;
const DEFAULT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_RETRY_MS: u64 = 5_000;

/// Options for the Kitsas server connection. Every field falls back to a
/// `KITSAS_*` environment variable when left unset.
#[derive(Debug, Clone, Default)]
pub struct ConnectionOptions {
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout_ms: Option<u64>,
}

/// Explicit startup options. Anything left `None` is resolved from the
/// environment or from the built-in default, in that order.
#[derive(Debug, Clone, Default)]
pub struct AddonOptions {
    pub app_name: Option<String>,
    pub port: Option<u16>,
    pub connection: ConnectionOptions,
    pub session_secret: Option<String>,
    /// Template file extension used by the view engine, `html` by default.
    pub view_engine: Option<String>,
    pub views_path: Option<String>,
    pub static_route: Option<String>,
    pub static_path: Option<String>,
    pub redirect_root: Option<bool>,
    pub base_url: Option<String>,
    pub session_store_url: Option<String>,
    pub session_prefix: Option<String>,
    pub session_ttl_secs: Option<u64>,
    pub connect_retry: Option<RetryPolicy>,
}

impl AddonOptions {
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = Some(name.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn session_secret(mut self, secret: impl Into<String>) -> Self {
        self.session_secret = Some(secret.into());
        self
    }

    pub fn views_path(mut self, path: impl Into<String>) -> Self {
        self.views_path = Some(path.into());
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn redirect_root(mut self, redirect: bool) -> Self {
        self.redirect_root = Some(redirect);
        self
    }

    pub fn connect_retry(mut self, policy: RetryPolicy) -> Self {
        self.connect_retry = Some(policy);
        self
    }
}

/// How the background connect task retries a failed Kitsas connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_RETRY_MS),
            max_attempts: None,
        }
    }
}

/// Resolved connection settings handed to a [`crate::Connector`].
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct AddonConfig {
    pub app_name: String,
    pub port: u16,
    pub connection: ConnectionConfig,
    pub session_secret: String,
    /// True when no secret was configured and a random one was generated.
    pub session_secret_generated: bool,
    pub view_engine: String,
    pub views_path: String,
    pub static_route: String,
    pub static_path: String,
    pub redirect_root: bool,
    pub base_url: String,
    pub session_store_url: String,
    pub session_prefix: String,
    pub session_ttl: Duration,
    pub connect_retry: RetryPolicy,
}

impl AddonConfig {
    /// Resolve the options against the process environment.
    pub fn from_options(options: AddonOptions) -> Result<Self> {
        let AddonOptions {
            app_name,
            port,
            connection,
            session_secret,
            view_engine,
            views_path,
            static_route,
            static_path,
            redirect_root,
            base_url,
            session_store_url,
            session_prefix,
            session_ttl_secs,
            connect_retry,
        } = options;

        let app_name = app_name
            .or_else(|| env_string("APP_NAME"))
            .unwrap_or_else(|| DEFAULT_APP_NAME.to_owned());
        let port = match port {
            Some(port) => port,
            None => parse_optional_u16("PORT")?.unwrap_or(DEFAULT_PORT),
        };

        let (session_secret, session_secret_generated) =
            match session_secret.or_else(|| env_string("SESSION_SECRET")) {
                Some(secret) => (secret, false),
                None => (random_secret(), true),
            };

        let base_url = base_url
            .or_else(|| env_string("BASE_URL"))
            .unwrap_or_else(|| format!("http://localhost:{}", port));

        let timeout_ms = match connection.timeout_ms {
            Some(ms) => ms,
            None => parse_optional_u64("KITSAS_TIMEOUT_MS")?.unwrap_or(DEFAULT_TIMEOUT_MS),
        };
        let connection = ConnectionConfig {
            url: connection
                .url
                .or_else(|| env_string("KITSAS_URL"))
                .unwrap_or_else(|| DEFAULT_KITSAS_URL.to_owned()),
            username: connection.username.or_else(|| env_string("KITSAS_USERNAME")),
            password: connection.password.or_else(|| env_string("KITSAS_PASSWORD")),
            timeout: Duration::from_millis(timeout_ms),
        };

        let session_ttl_secs = match session_ttl_secs {
            Some(secs) => secs,
            None => parse_optional_u64("SESSION_TTL_SECS")?.unwrap_or(DEFAULT_SESSION_TTL_SECS),
        };

        let connect_retry = match connect_retry {
            Some(policy) => policy,
            None => RetryPolicy {
                interval: Duration::from_millis(
                    parse_optional_u64("KITSAS_CONNECT_RETRY_MS")?.unwrap_or(DEFAULT_RETRY_MS),
                ),
                max_attempts: parse_optional_u64("KITSAS_CONNECT_MAX_ATTEMPTS")?
                    .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
                    .filter(|n| *n > 0),
            },
        };

        Ok(Self {
            app_name,
            port,
            connection,
            session_secret,
            session_secret_generated,
            view_engine: view_engine.unwrap_or_else(|| "html".to_owned()),
            views_path: views_path.unwrap_or_else(|| "views".to_owned()),
            static_route: static_route.unwrap_or_else(|| "/static".to_owned()),
            static_path: static_path.unwrap_or_else(|| "public".to_owned()),
            redirect_root: match redirect_root {
                Some(flag) => flag,
                None => parse_bool_env("REDIRECT_ROOT")?.unwrap_or(true),
            },
            base_url,
            session_store_url: session_store_url
                .or_else(|| env_string("REDIS_URL"))
                .unwrap_or_else(|| DEFAULT_REDIS_URL.to_owned()),
            session_prefix: session_prefix
                .or_else(|| env_string("REDIS_PREFIX"))
                .unwrap_or_else(|| DEFAULT_SESSION_PREFIX.to_owned()),
            session_ttl: Duration::from_secs(session_ttl_secs.max(1)),
            connect_retry,
        })
    }

    /// Resolve with no explicit options, environment and defaults only.
    pub fn from_env() -> Result<Self> {
        Self::from_options(AddonOptions::default())
    }
}

fn env_string(var: &str) -> Option<String> {
    env::var(var).ok().filter(|v| !v.trim().is_empty())
}

fn parse_optional_u64(var: &str) -> Result<Option<u64>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a positive integer", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_optional_u16(var: &str) -> Result<Option<u16>> {
    match parse_optional_u64(var)? {
        Some(value) => u16::try_from(value)
            .map(Some)
            .map_err(|_| anyhow!("{} must be a valid port number", var)),
        None => Ok(None),
    }
}

fn parse_bool_env(var: &str) -> Result<Option<bool>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value)
            .map(Some)
            .ok_or_else(|| anyhow!("{} must be a boolean (true/false/1/0)", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;
    use std::sync::Mutex;

    static ENV_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    const VARS: &[&str] = &[
        "APP_NAME",
        "PORT",
        "SESSION_SECRET",
        "BASE_URL",
        "KITSAS_URL",
        "KITSAS_USERNAME",
        "KITSAS_PASSWORD",
        "KITSAS_TIMEOUT_MS",
        "REDIS_URL",
        "REDIS_PREFIX",
        "REDIRECT_ROOT",
        "SESSION_TTL_SECS",
        "KITSAS_CONNECT_RETRY_MS",
        "KITSAS_CONNECT_MAX_ATTEMPTS",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn parses_environment_defaults() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();

        let cfg = AddonConfig::from_env().unwrap();
        assert_eq!(cfg.app_name, "Addon");
        assert_eq!(cfg.port, 3210);
        assert_eq!(cfg.base_url, "http://localhost:3210");
        assert_eq!(cfg.view_engine, "html");
        assert_eq!(cfg.static_route, "/static");
        assert_eq!(cfg.static_path, "public");
        assert!(cfg.redirect_root);
        assert_eq!(cfg.session_store_url, "redis://localhost:6379");
        assert_eq!(cfg.session_prefix, "SESSION");
        assert_eq!(cfg.session_ttl, Duration::from_secs(86_400));
        assert_eq!(cfg.connect_retry, RetryPolicy::default());
        assert!(cfg.session_secret_generated);
        assert_eq!(cfg.session_secret.len(), 64);
    }

    #[test]
    fn explicit_options_override_environment() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        std::env::set_var("APP_NAME", "FromEnv");
        std::env::set_var("PORT", "4000");
        std::env::set_var("SESSION_SECRET", "env-secret");

        let cfg = AddonConfig::from_options(
            AddonOptions::default()
                .app_name("Explicit")
                .session_secret("explicit-secret"),
        )
        .unwrap();
        assert_eq!(cfg.app_name, "Explicit");
        assert_eq!(cfg.port, 4000);
        assert_eq!(cfg.base_url, "http://localhost:4000");
        assert_eq!(cfg.session_secret, "explicit-secret");
        assert!(!cfg.session_secret_generated);

        clear_env();
    }

    #[test]
    fn parses_full_environment() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        std::env::set_var("SESSION_SECRET", "s3cret");
        std::env::set_var("BASE_URL", "https://addon.example.com");
        std::env::set_var("KITSAS_URL", "https://kitsas.example.com");
        std::env::set_var("KITSAS_USERNAME", "addon");
        std::env::set_var("KITSAS_TIMEOUT_MS", "2500");
        std::env::set_var("REDIS_URL", "redis://cache:6379");
        std::env::set_var("REDIS_PREFIX", "ADDON");
        std::env::set_var("REDIRECT_ROOT", "off");
        std::env::set_var("SESSION_TTL_SECS", "600");
        std::env::set_var("KITSAS_CONNECT_RETRY_MS", "250");
        std::env::set_var("KITSAS_CONNECT_MAX_ATTEMPTS", "3");

        let cfg = AddonConfig::from_env().unwrap();
        assert_eq!(cfg.session_secret, "s3cret");
        assert!(!cfg.session_secret_generated);
        assert_eq!(cfg.base_url, "https://addon.example.com");
        assert_eq!(cfg.connection.url, "https://kitsas.example.com");
        assert_eq!(cfg.connection.username.as_deref(), Some("addon"));
        assert!(cfg.connection.password.is_none());
        assert_eq!(cfg.connection.timeout, Duration::from_millis(2500));
        assert_eq!(cfg.session_store_url, "redis://cache:6379");
        assert_eq!(cfg.session_prefix, "ADDON");
        assert!(!cfg.redirect_root);
        assert_eq!(cfg.session_ttl, Duration::from_secs(600));
        assert_eq!(cfg.connect_retry.interval, Duration::from_millis(250));
        assert_eq!(cfg.connect_retry.max_attempts, Some(3));

        clear_env();
    }

    #[test]
    fn rejects_malformed_port() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        std::env::set_var("PORT", "99999");
        let err = AddonConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("PORT"));
        clear_env();
    }
}
