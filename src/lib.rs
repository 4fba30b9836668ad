use std::sync::Arc;

use axum::{Router, extract::FromRef, http::HeaderName};
use utoipa_swagger_ui::SwaggerUi;

use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::{DefaultOnResponse, TraceLayer},
};
use tracing::{Level, Span};

// --- Module Structure ---

// Resource model and the startup-time catalogue.
pub mod models;
pub mod registry;

// Request pipeline: credentials, gate, validation, expansion, operations.
pub mod actions;
pub mod auth;
pub mod authorization;
pub mod expand;
pub mod handlers;
pub mod validation;

// Collaborators and ambient concerns.
pub mod config;
pub mod error;
pub mod openapi;
pub mod repository;

// Route generation plus the fixed public and testing routes.
pub mod routes;
pub mod sample;

use config::Env;
use routes::{RouteGenerator, public, testing};

// --- Public Re-exports ---

pub use config::AppConfig;
pub use error::ApiError;
pub use registry::{ResourceHandle, ResourceRegistry};
pub use repository::{InMemoryRepository, PostgresRepository, RepositoryState};
pub use routes::RouteOptions;

/// AppState
///
/// The single, cloneable container shared by every request: the store, the
/// frozen resource registry and the configuration.
#[derive(Clone)]
pub struct AppState {
    /// Persistence collaborator (Postgres or in-memory).
    pub repo: RepositoryState,
    /// Registered resources. Read-only once the server is running.
    pub registry: Arc<ResourceRegistry>,
    pub config: AppConfig,
}

impl AppState {
    /// new
    ///
    /// Freezes the registry and lets the store prepare each collection
    /// (unique indexes).
    pub async fn new(repo: RepositoryState, registry: ResourceRegistry, config: AppConfig) -> Result<Self, ApiError> {
        for resource in registry.resources() {
            repo.prepare(resource.name(), &resource.unique_paths()).await?;
        }
        Ok(Self {
            repo,
            registry: Arc::new(registry),
            config,
        })
    }
}

// --- Axum FromRef Extractor Implementations ---

impl FromRef<AppState> for RepositoryState {
    fn from_ref(app_state: &AppState) -> RepositoryState {
        app_state.repo.clone()
    }
}

/// create_router
///
/// Assembles the generated resource routes with the fixed routes, the API
/// documentation and the observability layers.
pub fn create_router(state: AppState, routes: &RouteGenerator) -> Router {
    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_origin(Any)
        .allow_headers(Any);

    let x_request_id = HeaderName::from_static("x-request-id");

    let mut base_router = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", openapi::api_document(routes)))
        .merge(public::public_routes())
        .merge(routes.router());

    // clearData wipes every collection; it only exists for local test runs.
    if state.config.env == Env::Local {
        base_router = base_router.merge(testing::testing_routes(routes.api_path()));
    }

    base_router
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::new(x_request_id.clone(), MakeRequestUuid))
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(trace_span_logger)
                        .on_response(
                            DefaultOnResponse::new()
                                .level(Level::INFO)
                                .latency_unit(tower_http::LatencyUnit::Millis),
                        ),
                )
                .layer(PropagateRequestIdLayer::new(x_request_id)),
        )
        .layer(cors)
}

/// trace_span_logger
///
/// Span for `TraceLayer` carrying the request id, so every log line of one
/// request can be correlated.
fn trace_span_logger(request: &axum::http::Request<axum::body::Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("unknown");

    tracing::info_span!(
        "http_request",
        method = ?request.method(),
        uri = ?request.uri(),
        req_id = %request_id,
    )
}
