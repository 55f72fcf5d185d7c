//! Health check endpoints
//!
//! Provides simple health check for monitoring probes.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde::Serialize;

use crate::http::AppState;

/// Health check router
pub fn create_health_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/health/ready", get(readiness_check))
}

/// Basic health check (always returns OK if server is running)
pub async fn health_check() -> impl IntoResponse {
    "OK"
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,
    pub connections: usize,
    pub messages: usize,
}

/// Readiness check with live counters; 503 once shutdown has begun
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let shutting_down = state.engine.shutdown_token().is_cancelled();
    let body = ReadinessResponse {
        status: if shutting_down { "shutting_down" } else { "ok" },
        connections: state.engine.connection_count().await,
        messages: state.engine.message_count().await,
    };

    let status = if shutting_down {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (status, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::create_router;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use relaychat_core::LogStore;
    use relaychat_hub::{RelayEngine, RelayPolicy};
    use tower::ServiceExt;

    async fn test_router(dir: &tempfile::TempDir) -> (Router, RelayEngine) {
        let store = LogStore::open(dir.path().join("messages.json")).await;
        let engine = RelayEngine::new(store, RelayPolicy::default());
        let router = create_router(AppState::new(engine.clone(), relaychat_core::config::DEFAULT_MAX_FRAME_BYTES));
        (router, engine)
    }

    #[tokio::test]
    async fn test_health_returns_ok() {
        let dir = tempfile::tempdir().unwrap();
        let (router, _engine) = test_router(&dir).await;

        let response = router
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"OK");
    }

    #[tokio::test]
    async fn test_readiness_reports_counters() {
        let dir = tempfile::tempdir().unwrap();
        let (router, engine) = test_router(&dir).await;
        engine.submit(relaychat_proto::Side::Left, "hello".into()).await;

        let response = router
            .oneshot(Request::get("/health/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["connections"], 0);
        assert_eq!(json["messages"], 1);
    }

    #[tokio::test]
    async fn test_readiness_unavailable_after_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let (router, engine) = test_router(&dir).await;
        engine.shutdown().await;

        let response = router
            .oneshot(Request::get("/health/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_plain_request_to_chat_path_is_not_upgraded() {
        let dir = tempfile::tempdir().unwrap();
        let (router, _engine) = test_router(&dir).await;

        let response = router
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert!(response.status().is_client_error());
    }
}
