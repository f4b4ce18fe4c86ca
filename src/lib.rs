//! Core library for Kitsas addons.  This module wires together the
//! addon host: configuration, the Kitsas connection lifecycle, the
//! readiness gate, session handling and router registration.
//!
//! A typical addon creates a [`KitsasAddon`], registers its routers and
//! calls [`KitsasAddon::start`]:
//!
//! ```no_run
//! use axum::routing::get;
//! use kitsas_addon::{AddonCall, AddonOptions, KitsasAddon};
//!
//! async fn index(call: AddonCall) -> String {
//!     format!("Hello {}", call.user_name())
//! }
//!
//! # async fn run() -> Result<(), kitsas_addon::AddonError> {
//! let mut addon = KitsasAddon::new(AddonOptions::default().app_name("Demo"))?;
//! addon.create_default_router().route("/", get(index));
//! addon.start().await
//! # }
//! ```

mod config;
mod error;

pub mod auth;
pub mod call;
pub mod connection;
pub mod logging;
pub mod maintenance;
pub mod session;
pub mod util;
pub mod views;

pub use call::AddonCall;
pub use config::{
    AddonConfig, AddonOptions, ConnectionConfig, ConnectionOptions, RetryPolicy,
};
pub use connection::{
    AddonLogEntry, Book, Connector, HttpConnector, KitsasConnection, LanguageString, LogStatus,
    NewNotification, Notification, NotificationType,
};
pub use error::{AddonError, ConnectionError, SessionError};
pub use logging::init_tracing;
pub use maintenance::MaintenanceRouter;
pub use session::{
    CallInfo, MemorySessionStore, RedisSessionStore, Session, SessionBackend, SessionRecord,
};

use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::header::LOCATION;
use axum::http::{StatusCode, Uri};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, MethodRouter};
use axum::{Extension, Router};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::services::ServeDir;
use tower_sessions::cookie::SameSite;
use tower_sessions::SessionManagerLayer;

use crate::util::normalize_path;
use crate::views::Views;

pub const DEFAULT_ROUTER_PATH: &str = "/addon";
const UNREADY_MESSAGE: &str = "Service is starting...";
const SESSION_SWEEP_PERIOD: Duration = Duration::from_secs(60);

/// Where the addon is in establishing its Kitsas connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Uninitialized,
    Connecting,
    Ready,
}

enum ConnectionSlot {
    Uninitialized,
    Connecting,
    Ready(Arc<dyn KitsasConnection>),
}

struct AddonShared {
    config: AddonConfig,
    views: Views,
    slot: RwLock<ConnectionSlot>,
}

/// Process-wide addon state shared with every request. The connection
/// slot is written by the connect task only; handlers read it.
#[derive(Clone)]
pub struct AddonState {
    inner: Arc<AddonShared>,
}

impl AddonState {
    pub fn new(config: AddonConfig) -> Self {
        let views = Views::new(
            &config.views_path,
            &config.view_engine,
            &config.app_name,
            &config.base_url,
        );
        Self {
            inner: Arc::new(AddonShared {
                config,
                views,
                slot: RwLock::new(ConnectionSlot::Uninitialized),
            }),
        }
    }

    pub fn config(&self) -> &AddonConfig {
        &self.inner.config
    }

    pub fn views(&self) -> &Views {
        &self.inner.views
    }

    pub fn base_url(&self) -> &str {
        &self.inner.config.base_url
    }

    pub fn lifecycle(&self) -> Lifecycle {
        match *self.inner.slot.read().unwrap_or_else(PoisonError::into_inner) {
            ConnectionSlot::Uninitialized => Lifecycle::Uninitialized,
            ConnectionSlot::Connecting => Lifecycle::Connecting,
            ConnectionSlot::Ready(_) => Lifecycle::Ready,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.lifecycle() == Lifecycle::Ready
    }

    pub fn connection(&self) -> Option<Arc<dyn KitsasConnection>> {
        match &*self.inner.slot.read().unwrap_or_else(PoisonError::into_inner) {
            ConnectionSlot::Ready(conn) => Some(conn.clone()),
            _ => None,
        }
    }

    pub fn require_connection(&self) -> Result<Arc<dyn KitsasConnection>, ConnectionError> {
        self.connection().ok_or(ConnectionError::NotReady)
    }

    /// Make `connection` available to all requests from now on.
    pub fn install_connection(&self, connection: Arc<dyn KitsasConnection>) {
        *self.inner.slot.write().unwrap_or_else(PoisonError::into_inner) =
            ConnectionSlot::Ready(connection);
    }

    fn mark_pending(&self, lifecycle: Lifecycle) {
        let mut slot = self.inner.slot.write().unwrap_or_else(PoisonError::into_inner);
        if matches!(*slot, ConnectionSlot::Ready(_)) {
            return;
        }
        *slot = match lifecycle {
            Lifecycle::Connecting => ConnectionSlot::Connecting,
            _ => ConnectionSlot::Uninitialized,
        };
    }

    pub(crate) fn unready_response(&self) -> Response {
        self.views().respond(
            StatusCode::SERVICE_UNAVAILABLE,
            "unready",
            None,
            UNREADY_MESSAGE,
        )
    }
}

/// A router queued for mounting under `path`. Protected routers get the
/// call authentication middleware.
pub struct AddonRouter {
    path: String,
    use_middleware: bool,
    router: Router,
}

impl AddonRouter {
    fn new(path: &str, use_middleware: bool) -> Self {
        Self {
            path: normalize_path(path),
            use_middleware,
            router: Router::new(),
        }
    }

    pub fn route(&mut self, path: &str, method_router: MethodRouter) -> &mut Self {
        let router = std::mem::take(&mut self.router);
        self.router = router.route(path, method_router);
        self
    }

    pub fn merge(&mut self, other: Router) -> &mut Self {
        let router = std::mem::take(&mut self.router);
        self.router = router.merge(other);
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn uses_middleware(&self) -> bool {
        self.use_middleware
    }
}

/// The addon host. Create it, register routers, then [`start`](Self::start).
pub struct KitsasAddon {
    state: AddonState,
    connector: Arc<dyn Connector>,
    session_store: Option<SessionBackend>,
    routers: Vec<AddonRouter>,
}

impl KitsasAddon {
    /// Resolve configuration from `options`, the environment and defaults.
    pub fn new(options: AddonOptions) -> anyhow::Result<Self> {
        let config = AddonConfig::from_options(options)?;
        Ok(Self::with_config(config))
    }

    pub fn with_config(config: AddonConfig) -> Self {
        if config.session_secret_generated {
            tracing::warn!(
                app = %config.app_name,
                "SESSION_SECRET not set, generated a random session secret; sessions will not survive a restart"
            );
        }
        Self {
            state: AddonState::new(config),
            connector: Arc::new(HttpConnector),
            session_store: None,
            routers: Vec::new(),
        }
    }

    pub fn with_connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Arc::new(connector);
        self
    }

    /// Use `store` instead of connecting to Redis at startup.
    pub fn with_session_store(mut self, store: impl Into<SessionBackend>) -> Self {
        self.session_store = Some(store.into());
        self
    }

    pub fn config(&self) -> &AddonConfig {
        self.state.config()
    }

    pub fn state(&self) -> AddonState {
        self.state.clone()
    }

    pub fn router_count(&self) -> usize {
        self.routers.len()
    }

    /// Queue a new router for `path`. With `use_middleware` its requests
    /// must carry a valid call id or an authenticated session; pass `false`
    /// for webhooks and similar.
    pub fn create_router(&mut self, path: &str, use_middleware: bool) -> &mut AddonRouter {
        self.routers.push(AddonRouter::new(path, use_middleware));
        let last = self.routers.len() - 1;
        &mut self.routers[last]
    }

    /// Protected router at `/addon`.
    pub fn create_default_router(&mut self) -> &mut AddonRouter {
        self.create_router(DEFAULT_ROUTER_PATH, true)
    }

    /// Start the background task that connects to Kitsas.
    pub fn connect_in_background(&self) -> JoinHandle<()> {
        tokio::spawn(supervise_connection(
            self.state.clone(),
            self.connector.clone(),
        ))
    }

    async fn resolve_session_store(&self) -> SessionBackend {
        if let Some(store) = &self.session_store {
            return store.clone();
        }
        let config = self.state.config();
        match RedisSessionStore::connect(&config.session_store_url, &config.session_prefix).await {
            Ok(store) => {
                tracing::info!(url = %config.session_store_url, "Redis connection successful");
                store.into()
            }
            Err(err) => {
                tracing::error!(
                    url = %config.session_store_url,
                    error = %err,
                    "Redis connection failed, keeping sessions in memory"
                );
                MemorySessionStore::new().into()
            }
        }
    }

    /// Build the complete application: session store, queued routers,
    /// static files, root redirect and the shared middleware stack.
    pub async fn into_app(self) -> Router {
        let store = self.resolve_session_store().await;
        if let SessionBackend::Memory(memory) = &store {
            memory.spawn_sweeper(SESSION_SWEEP_PERIOD);
        }
        let state = self.state;
        let config = state.config();
        let sessions = SessionManagerLayer::new(store)
            .with_name(session::SESSION_COOKIE)
            .with_same_site(SameSite::Lax)
            .with_http_only(true)
            .with_secure(config.base_url.starts_with("https://"))
            .with_always_save(true)
            .with_expiry(session::inactivity_expiry(config.session_ttl))
            .with_signed(session::signing_key(&config.session_secret));

        let mut grouped: Vec<(String, Router)> = Vec::new();
        for registration in self.routers {
            let router = if registration.use_middleware {
                registration.router.layer(middleware::from_fn_with_state(
                    state.clone(),
                    auth::authenticate,
                ))
            } else {
                registration.router
            };
            match grouped.iter_mut().find(|(path, _)| *path == registration.path) {
                Some((_, existing)) => {
                    let previous = std::mem::take(existing);
                    *existing = previous.merge(router);
                }
                None => grouped.push((registration.path, router)),
            }
        }

        let has_root_router = grouped.iter().any(|(path, _)| path == "/");
        let mut app = Router::new();
        for (path, router) in grouped {
            app = if path == "/" {
                app.merge(router)
            } else {
                app.nest(&path, router)
            };
        }

        let static_route = normalize_path(&config.static_route);
        let static_files = ServeDir::new(&config.static_path);
        app = if static_route == "/" {
            app.fallback_service(static_files)
        } else {
            app.nest_service(&static_route, static_files)
        };

        if config.redirect_root && !has_root_router {
            app = app.route("/", get(redirect_root));
        }

        app.layer(sessions)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            readiness_gate,
        ))
        .layer(middleware::from_fn(logging::access_log))
        .layer(Extension(state))
    }

    /// Run the addon: build the app, connect to Kitsas in the background
    /// and serve on the configured port until Ctrl+C.
    pub async fn start(self) -> Result<(), AddonError> {
        let state = self.state.clone();
        let connector = self.connector.clone();
        let port = state.config().port;
        let router_count = self.routers.len();
        tracing::debug!(app = %state.config().app_name, "starting addon");

        let app = self.into_app().await;
        tokio::spawn(supervise_connection(state, connector));

        let addr: SocketAddr = ([0, 0, 0, 0], port).into();
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(port, routerCount = router_count, "Listening for connections");
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        Ok(())
    }
}

/// Connect to Kitsas, retrying at a fixed interval. Failures only reach
/// the log.
async fn supervise_connection(state: AddonState, connector: Arc<dyn Connector>) {
    let policy = state.config().connect_retry;
    let mut attempt: u32 = 0;
    loop {
        attempt = attempt.saturating_add(1);
        state.mark_pending(Lifecycle::Connecting);
        match connector.connect(&state.config().connection).await {
            Ok(connection) => {
                tracing::info!(name = %connection.name(), attempt, "Connected to Kitsas");
                state.install_connection(connection);
                return;
            }
            Err(err) => {
                if policy.max_attempts.is_some_and(|max| attempt >= max) {
                    tracing::error!(error = %err, attempts = attempt, "Giving up connecting to Kitsas");
                    state.mark_pending(Lifecycle::Uninitialized);
                    return;
                }
                tracing::warn!(
                    error = %err,
                    attempt,
                    retry_in_ms = policy.interval.as_millis() as u64,
                    "Failed to connect to Kitsas, retrying"
                );
                tokio::time::sleep(policy.interval).await;
            }
        }
    }
}

async fn readiness_gate(State(state): State<AddonState>, req: Request, next: Next) -> Response {
    if state.is_ready() {
        next.run(req).await
    } else {
        state.unready_response()
    }
}

async fn redirect_root(uri: Uri) -> Response {
    let location = match uri.query() {
        Some(query) => format!("{}?{}", DEFAULT_ROUTER_PATH, query),
        None => DEFAULT_ROUTER_PATH.to_owned(),
    };
    (StatusCode::FOUND, [(LOCATION, location)]).into_response()
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
