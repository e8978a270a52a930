//! HTTP/WebSocket server: routes, background tasks, graceful shutdown.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use parley_core::close_code;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::api;
use crate::auth::UpgradeRequest;
use crate::context::AppContext;
use crate::health::{HealthInputs, HealthResponse, health_check};
use crate::scheduler::RingTimeoutSweeper;
use crate::websocket::liveness::LivenessMonitor;
use crate::websocket::session::run_ws_session;

/// The realtime server.
pub struct ParleyServer {
    ctx: Arc<AppContext>,
}

impl ParleyServer {
    /// Take ownership of the application context.
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }

    /// The shared application context.
    pub fn context(&self) -> &Arc<AppContext> {
        &self.ctx
    }

    /// Build the axum router: WebSocket upgrade, health, metrics, call API.
    pub fn router(&self) -> Router {
        Router::new()
            .route(&self.ctx.config.ws_path, get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .merge(api::routes())
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(self.ctx.clone())
    }

    /// Subscribe the conversation pattern and spawn the liveness monitor and
    /// ring-timeout sweeper. Both stop when shutdown begins.
    pub async fn start_background(&self) {
        let ctx = &self.ctx;
        ctx.router.start().await;

        let liveness = LivenessMonitor::new(
            ctx.connections.clone(),
            ctx.config.heartbeat_interval,
            ctx.config.idle_timeout,
        );
        ctx.shutdown.track(liveness.spawn(ctx.shutdown.token()));

        let sweeper = RingTimeoutSweeper::new(
            ctx.calls.clone(),
            ctx.config.ring_timeout,
            ctx.config.ring_sweep_interval,
        );
        ctx.shutdown.track(sweeper.spawn(ctx.shutdown.token()));
    }

    /// Bind the configured address, start background tasks and serve until
    /// shutdown. Returns the bound address (useful with port `0`).
    pub async fn listen(&self) -> std::io::Result<SocketAddr> {
        let addr = format!("{}:{}", self.ctx.config.host, self.ctx.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let local = listener.local_addr()?;
        self.start_background().await;

        let app = self.router();
        let token = self.ctx.shutdown.token();
        let serve = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                error!(error = %e, "server error");
            }
        });
        self.ctx.shutdown.track(serve);
        info!(addr = %local, ws_path = %self.ctx.config.ws_path, "parley server listening");
        Ok(local)
    }

    /// Stop sweeps, close every socket with 1001, close the fanout adapter,
    /// then wait for background tasks.
    pub async fn shutdown(&self, timeout: Option<Duration>) {
        let ctx = &self.ctx;
        ctx.shutdown.shutdown();
        let closed = ctx
            .connections
            .close_all(close_code::GOING_AWAY, "server shutdown");
        info!(closed, "closing connections for shutdown");
        ctx.fanout.close().await;
        ctx.shutdown.graceful_shutdown(timeout).await;
        info!("server stopped");
    }
}

impl std::fmt::Debug for ParleyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParleyServer").field("ctx", &self.ctx).finish()
    }
}

/// GET {ws_path}
async fn ws_handler(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if ctx.shutdown.is_shutting_down() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let request = UpgradeRequest::new(query, headers);
    ws.max_message_size(ctx.config.max_message_size)
        .on_upgrade(move |socket| run_ws_session(socket, request, ctx))
}

/// GET /health
async fn health_handler(State(ctx): State<Arc<AppContext>>) -> Json<HealthResponse> {
    Json(health_check(HealthInputs {
        start_time: ctx.start_time,
        connections: ctx.connections.connection_count(),
        users: ctx.connections.user_count(),
        fanout: ctx.fanout.is_enabled(),
        instance_id: ctx.fanout.instance_id().as_str(),
        draining: ctx.shutdown.is_shutting_down(),
    }))
}

/// GET /metrics
async fn metrics_handler(State(ctx): State<Arc<AppContext>>) -> Response {
    match &ctx.metrics {
        Some(handle) => crate::metrics::render(handle).into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed").into_response(),
    }
}
