use crate::AppState;
use axum::{Router, routing::get};

/// Public Router Module
///
/// Endpoints that are not generated from the registry and need no credentials.
pub fn public_routes() -> Router<AppState> {
    Router::new()
        // GET /health
        // Used by load balancers and the test harness to wait for readiness.
        .route("/health", get(|| async { "ok" }))
}
