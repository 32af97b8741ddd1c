//! Health endpoints for the relay.
//!
//! - `GET /health` - Liveness probe (is the process running?)
//! - `GET /ready` - Readiness probe (is the listener up and not draining?)
//!
//! The `/metrics` endpoint is mounted separately in [`crate::routes`].

use axum::{extract::State, http::StatusCode, routing::get, Router};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Liveness and readiness flags.
///
/// Live from startup until the coordinator or HTTP server stops
/// unexpectedly. Ready only while the listener is bound and not draining.
#[derive(Debug)]
pub struct HealthState {
    live: AtomicBool,
    ready: AtomicBool,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Live, not yet ready.
    #[must_use]
    pub fn new() -> Self {
        Self {
            live: AtomicBool::new(true),
            ready: AtomicBool::new(false),
        }
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn set_not_ready(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    /// A task the relay cannot run without has stopped. Both probes fail
    /// from here on.
    pub fn mark_failed(&self) {
        self.ready.store(false, Ordering::SeqCst);
        self.live.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

/// `/health` and `/ready`.
pub fn health_router(health_state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .with_state(health_state)
}

fn probe_status(ok: bool) -> StatusCode {
    if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn liveness_handler(State(state): State<Arc<HealthState>>) -> StatusCode {
    probe_status(state.is_live())
}

async fn readiness_handler(State(state): State<Arc<HealthState>>) -> StatusCode {
    probe_status(state.is_ready())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;

    #[test]
    fn test_health_state_default() {
        let state = HealthState::new();
        assert!(state.is_live(), "Should be live by default");
        assert!(!state.is_ready(), "Should not be ready by default");
    }

    #[test]
    fn test_health_state_set_ready() {
        let state = HealthState::new();

        state.set_ready();
        assert!(state.is_ready(), "Should be ready after set_ready()");

        state.set_not_ready();
        assert!(
            !state.is_ready(),
            "Should not be ready after set_not_ready()"
        );
    }

    #[test]
    fn test_mark_failed_clears_both_flags() {
        let state = HealthState::new();
        state.set_ready();

        state.mark_failed();
        assert!(!state.is_live());
        assert!(!state.is_ready());
    }

    #[tokio::test]
    async fn test_liveness_fails_after_mark_failed() {
        let state = Arc::new(HealthState::new());
        state.mark_failed();

        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .expect("Failed to build request");
        let response = health_router(state)
            .oneshot(request)
            .await
            .expect("Failed to execute request");

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_health_router_liveness_endpoint() {
        let app = health_router(Arc::new(HealthState::new()));

        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .expect("Failed to build request");

        let response = app
            .oneshot(request)
            .await
            .expect("Failed to execute request");

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_router_readiness_tracks_state() {
        let state = Arc::new(HealthState::new());

        let request = Request::builder()
            .uri("/ready")
            .body(Body::empty())
            .expect("Failed to build request");
        let response = health_router(Arc::clone(&state))
            .oneshot(request)
            .await
            .expect("Failed to execute request");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        state.set_ready();

        let request = Request::builder()
            .uri("/ready")
            .body(Body::empty())
            .expect("Failed to build request");
        let response = health_router(state)
            .oneshot(request)
            .await
            .expect("Failed to execute request");
        assert_eq!(response.status(), StatusCode::OK);
    }
}
