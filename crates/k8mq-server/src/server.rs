//! `QueServer`: axum router, listener lifecycle and shutdown sequence.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use k8mq_core::{Message, ReadCallback, ShutdownCoordinator};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::BrokerConfig;
use crate::error::ConfigError;
use crate::health::{self, HealthResponse, NOT_RUNNING_BODY, RUNNING_BODY};
use crate::registry::Registry;
use crate::websocket::que_handler;

/// Name reported by `GET /` and the binary.
pub const SERVICE_NAME: &str = "K8MQ Server";

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Connection registry.
    pub registry: Arc<Registry>,
    /// Receives inbound frames instead of the registry when set.
    pub reader: Option<ReadCallback>,
    /// Cancelled when the server closes.
    pub cancel: CancellationToken,
    /// Max inbound WebSocket message size.
    pub max_message_size: usize,
    running: Arc<AtomicBool>,
    start_time: Instant,
    metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// Whether probes should report healthy.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// The k8mq broker.
pub struct QueServer {
    config: BrokerConfig,
    registry: Arc<Registry>,
    shutdown: ShutdownCoordinator,
    running: Arc<AtomicBool>,
    reader: Option<ReadCallback>,
    metrics: Option<PrometheusHandle>,
    start_time: Instant,
}

impl QueServer {
    /// Validate `config` and start the registry. Call [`listen`](Self::listen)
    /// to accept connections.
    pub fn new(config: BrokerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let registry = Arc::new(Registry::new(
            config.mailbox_capacity,
            config.write_timeout(),
        ));
        Ok(Self {
            config,
            registry,
            shutdown: ShutdownCoordinator::new(),
            running: Arc::new(AtomicBool::new(true)),
            reader: None,
            metrics: None,
            start_time: Instant::now(),
        })
    }

    /// Hand every inbound frame to `reader` instead of rebroadcasting it.
    #[must_use]
    pub fn with_reader(mut self, reader: impl Fn(Message) + Send + Sync + 'static) -> Self {
        self.reader = Some(Arc::new(reader));
        self
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            registry: self.registry.clone(),
            reader: self.reader.clone(),
            cancel: self.shutdown.token(),
            max_message_size: self.config.max_message_size,
            running: self.running.clone(),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route("/", get(default_handler))
            .route("/status/live", get(status_handler))
            .route("/status/ready", get(status_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route(&self.config.que_path, get(que_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Bind `host:port` and serve until [`close`](Self::close).
    ///
    /// Returns the bound address; port `0` picks a free one.
    pub async fn listen(&self) -> std::io::Result<SocketAddr> {
        let listener = tokio::net::TcpListener::bind(self.config.bind_addr()).await?;
        let addr = listener.local_addr()?;
        let router = self.router();
        let token = self.shutdown.token();

        self.shutdown.track(tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = served {
                warn!(error = %e, "K8MQ Server closed with an error");
            }
        }));
        info!(%addr, que_path = %self.config.que_path, "K8MQ Server started");
        Ok(addr)
    }

    /// Fan `message` out to every connected client.
    pub async fn broadcast(&self, message: impl Into<Message>) -> k8mq_core::Result<()> {
        self.registry.broadcast(message).await
    }

    /// Stop reporting healthy, tell every client the broker is going away,
    /// then give them the grace window to react.
    pub async fn send_shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Err(e) = self.registry.broadcast(Message::shutdown()).await {
            warn!(error = %e, "could not broadcast shutdown message");
        }
        tokio::time::sleep(self.config.shutdown_grace()).await;
    }

    /// Drain the registry, then stop the listener and every connection
    /// handler, all within `timeout`.
    ///
    /// Broadcasts accepted before this call still reach the connections that
    /// are live; handlers keep their sockets open until the drain ends.
    pub async fn close(&self, timeout: Duration) -> k8mq_core::Result<()> {
        let deadline = Instant::now() + timeout;
        self.running.store(false, Ordering::SeqCst);

        let registry = self.registry.close(timeout).await;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let http = self.shutdown.graceful_shutdown("k8mq server", remaining).await;
        registry.and(http)
    }

    /// Whether probes currently report healthy.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Connections in the live list.
    pub fn connection_count(&self) -> usize {
        self.registry.live_count()
    }

    /// Get the server configuration.
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }
}

/// Service banner.
pub fn banner() -> String {
    format!("{SERVICE_NAME} {}", env!("CARGO_PKG_VERSION"))
}

/// GET /
async fn default_handler() -> Json<String> {
    Json(banner())
}

/// GET /status/live, GET /status/ready
async fn status_handler(State(state): State<AppState>) -> Response {
    if state.is_running() {
        (StatusCode::OK, RUNNING_BODY).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, NOT_RUNNING_BODY).into_response()
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.registry.live_count(),
        state.is_running(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
