//! HTTP routes for the relay.
//!
//! Defines the Axum router and application state.

use crate::actors::{ActorMetrics, ConnectionActor, CoordinatorActorHandle};
use crate::config::Config;
use crate::observability::{health_router, HealthState};
use crate::transport::websocket;

use axum::{
    extract::{ws::WebSocket, State, WebSocketUpgrade},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::debug;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Coordinator handle.
    pub coordinator: CoordinatorActorHandle,

    /// Service configuration.
    pub config: Config,

    /// Shared actor metrics.
    pub metrics: Arc<ActorMetrics>,

    /// Parent of every connection's cancel token.
    pub shutdown_token: CancellationToken,
}

/// Build the application routes.
///
/// Creates an Axum router with:
/// - `{ws_path}` - WebSocket upgrade for relay clients (default `/ws`)
/// - `/health` - Liveness probe
/// - `/ready` - Readiness probe
/// - `/metrics` - Prometheus metrics endpoint
/// - TraceLayer for request logging
pub fn build_routes(
    state: Arc<AppState>,
    health_state: Arc<HealthState>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let ws_routes = Router::new()
        .route(&state.config.ws_path, get(ws_handler))
        .with_state(state);

    // Metrics route with its own state
    let metrics_routes = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics_handle);

    ws_routes
        .merge(health_router(health_state))
        .merge(metrics_routes)
        .layer(TraceLayer::new_for_http())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.max_message_size(state.config.max_frame_bytes)
        .on_upgrade(move |socket| serve_connection(socket, state))
}

async fn serve_connection(socket: WebSocket, state: Arc<AppState>) {
    let (sink, stream) = websocket::into_frames(socket);

    let actor = ConnectionActor::new(
        state.coordinator.clone(),
        state.shutdown_token.child_token(),
        Arc::clone(&state.metrics),
        state.config.outbound_queue,
    );

    debug!(
        target: "relay.transport",
        connection_id = %actor.connection_id(),
        "WebSocket upgraded"
    );

    actor.run(stream, sink).await;
}

/// Render metrics in Prometheus text format.
async fn metrics_handler(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    handle.render()
}
