use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::repository::RepositoryError;

/// Stable, machine-readable error codes.
///
/// Clients match on `code` from `{"code": "NOT_FOUND", "message": "..."}`.
/// Messages may be reworded, codes never change.
pub mod error_code {
    pub const VALIDATION_FAILED: &str = "VALIDATION_FAILED";
    pub const ALREADY_EXISTS: &str = "ALREADY_EXISTS";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const UNAUTHENTICATED: &str = "UNAUTHENTICATED";
    pub const UPSTREAM_FAILURE: &str = "UPSTREAM_FAILURE";
}

/// ApiError
///
/// Every request-time failure of the generated routes. Each variant maps to one
/// error kind of the request pipeline and to a fixed HTTP status.
#[derive(Error, Debug)]
pub enum ApiError {
    /// Unknown, malformed or missing field in the input. HTTP 400.
    #[error("{0}")]
    Validation(String),

    /// A unique field collided with a live instance. HTTP 409.
    #[error("{0}")]
    DuplicateResource(String),

    /// Missing identifier or already-deleted instance. HTTP 404.
    #[error("{0}")]
    NotFound(String),

    /// Failed authentication or authorization gate. HTTP 401.
    #[error("{0}")]
    Unauthorized(String),

    /// Persistence or authentication collaborator failure. HTTP 500.
    #[error("{0}")]
    Upstream(String),
}

impl ApiError {
    pub fn error_code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => error_code::VALIDATION_FAILED,
            ApiError::DuplicateResource(_) => error_code::ALREADY_EXISTS,
            ApiError::NotFound(_) => error_code::NOT_FOUND,
            ApiError::Unauthorized(_) => error_code::UNAUTHENTICATED,
            ApiError::Upstream(_) => error_code::UPSTREAM_FAILURE,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::DuplicateResource(_) => StatusCode::CONFLICT,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub(crate) fn not_found(resource: &str, id: impl std::fmt::Display) -> Self {
        ApiError::NotFound(format!("{resource} '{id}' not found"))
    }

    pub(crate) fn unauthorized() -> Self {
        ApiError::Unauthorized("not authorized".to_string())
    }
}

impl From<RepositoryError> for ApiError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::Duplicate { resource, field } => ApiError::DuplicateResource(
                format!("{resource} with this '{field}' already exists"),
            ),
            RepositoryError::Upstream(cause) => ApiError::Upstream(cause),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // Upstream causes stay in the logs; clients get a generic message.
        let message = match &self {
            ApiError::Upstream(cause) => {
                tracing::error!(cause = %cause, "upstream failure");
                "upstream failure".to_string()
            }
            other => other.to_string(),
        };
        let body = serde_json::json!({
            "code": self.error_code(),
            "message": message,
        });
        (status, axum::Json(body)).into_response()
    }
}
