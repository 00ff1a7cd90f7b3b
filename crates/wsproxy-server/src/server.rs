//! `ProxyServer`: axum HTTP + WebSocket listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use futures::SinkExt;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::backend::BackendConnector;
use crate::config::ServerConfig;
use crate::error::Result;
use crate::health::{self, HealthResponse};
use crate::listener::{ParamError, RawParams};
use crate::liveness::LivenessMonitor;
use crate::metrics::SESSIONS_REJECTED_TOTAL;
use crate::session::{self, SessionContext};
use crate::shutdown::ShutdownCoordinator;

/// State shared by every axum handler.
#[derive(Clone)]
struct AppState {
    ctx: SessionContext,
    start_time: Instant,
    metrics: Option<PrometheusHandle>,
}

/// The WebSocket-to-TCP bridge server.
pub struct ProxyServer {
    ctx: SessionContext,
    shutdown: ShutdownCoordinator,
    start_time: Instant,
    metrics: Option<PrometheusHandle>,
}

impl ProxyServer {
    /// Build a server. Fails only if the TLS client config cannot be built.
    pub fn new(config: ServerConfig) -> Result<Self> {
        let connector = BackendConnector::new(config.tls_verify)?;
        Ok(Self::with_connector(config, connector))
    }

    /// Build a server around a preconfigured backend connector.
    pub fn with_connector(config: ServerConfig, connector: BackendConnector) -> Self {
        let shutdown = ShutdownCoordinator::new();
        let monitor = Arc::new(LivenessMonitor::new(config.ping_interval));
        Self {
            ctx: SessionContext {
                config: Arc::new(config),
                connector,
                monitor,
                shutdown: shutdown.token(),
            },
            shutdown,
            start_time: Instant::now(),
            metrics: None,
        }
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the router: `/health`, `/metrics` (if enabled), and the
    /// WebSocket bridge on every other path.
    pub fn router(&self) -> Router {
        let state = AppState {
            ctx: self.ctx.clone(),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
        };

        let mut router = Router::new().route("/health", get(health_handler));
        if self.metrics.is_some() {
            router = router.route("/metrics", get(metrics_handler));
        }
        router.fallback(ws_handler).with_state(state)
    }

    /// Bind, then serve and sweep in the background until shutdown.
    ///
    /// Returns the bound address and a handle that completes once both the
    /// HTTP server and the liveness sweep have stopped.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let config = &self.ctx.config;
        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        let addr = listener.local_addr()?;
        info!(
            %addr,
            mode = %config.mode,
            ping_interval_ms = u64::try_from(config.ping_interval.as_millis()).unwrap_or(u64::MAX),
            secret = config.secret.is_some(),
            "wsproxy listening"
        );

        let router = self.router();
        let token = self.shutdown.token();
        let monitor = Arc::clone(&self.ctx.monitor);

        let handle = tokio::spawn(async move {
            let sweep = monitor.run(token.clone());
            let serve = axum::serve(listener, router)
                .with_graceful_shutdown(token.cancelled_owned());
            let (served, ()) = tokio::join!(serve.into_future(), sweep);
            if let Err(e) = served {
                warn!(error = %e, "server stopped with error");
            }
            info!("wsproxy stopped");
        });

        Ok((addr, handle))
    }

    /// Liveness monitor shared by all sessions.
    pub fn monitor(&self) -> &Arc<LivenessMonitor> {
        &self.ctx.monitor
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    /// Resolved configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.ctx.config
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.ctx.monitor.len(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Upgrade on any other path. Parameters are validated after the upgrade so
/// rejections can be reported over the socket.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<RawParams>,
    State(state): State<AppState>,
) -> Response {
    ws.max_message_size(state.ctx.config.max_message_bytes)
        .on_upgrade(move |socket| handle_socket(socket, params, state.ctx))
}

async fn handle_socket(socket: WebSocket, params: RawParams, ctx: SessionContext) {
    let config = &ctx.config;
    match params.validate(config.mode, config.secret.as_deref()) {
        Ok(params) => {
            let _ = session::run(socket, params, ctx).await;
        }
        Err(e) => reject(socket, &e).await,
    }
}

/// Report a validation failure as one text frame, then close.
async fn reject(mut socket: WebSocket, error: &ParamError) {
    metrics::counter!(SESSIONS_REJECTED_TOTAL, "reason" => error.reason()).increment(1);
    info!(reason = error.reason(), "rejecting client: {error}");
    let _ = socket.send(Message::Text(error.to_string().into())).await;
    let _ = socket.send(Message::Close(None)).await;
    let _ = socket.close().await;
}
