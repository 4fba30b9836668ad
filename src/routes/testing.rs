use crate::{AppState, handlers};
use axum::{Router, routing::get};

/// Testing Router Module
///
/// Never mounted outside `Env::Local`.
pub fn testing_routes(api_path: &str) -> Router<AppState> {
    Router::new()
        // GET {api}/clearData
        // Wipes every resource collection between test scenarios.
        .route(&format!("{api_path}/clearData"), get(handlers::clear_data))
}
