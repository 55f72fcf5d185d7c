// Module: http
// Router for the relay: health probes plus the WebSocket endpoint

pub mod health;
pub mod websocket;

use axum::Router;
use relaychat_hub::RelayEngine;
use tokio_util::task::TaskTracker;
use tower_http::trace::TraceLayer;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: RelayEngine,
    /// Operator safety cap on one inbound WebSocket message, in bytes
    pub max_frame_bytes: usize,
    /// Every upgraded connection task, so shutdown can wait for their close frames
    pub connections: TaskTracker,
}

impl AppState {
    #[must_use]
    pub fn new(engine: RelayEngine, max_frame_bytes: usize) -> Self {
        Self {
            engine,
            max_frame_bytes,
            connections: TaskTracker::new(),
        }
    }
}

/// Create the HTTP router
///
/// `/health` and `/health/ready` answer plain HTTP. Every other path is the
/// chat WebSocket endpoint; chat traffic is not routed by path.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::create_health_router())
        .fallback(websocket::websocket_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
