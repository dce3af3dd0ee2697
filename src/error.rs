//! Error taxonomy shared across the service.
//!
//! Every fallible component returns [`FirewallError`]; the HTTP layer maps
//! each variant to the status codes in the external interface contract.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum FirewallError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("policy '{0}' already exists")]
    PolicyConflict(String),

    #[error("connection '{0}' not found")]
    ConnectionNotFound(String),

    #[error("anomaly scorer failed: {0}")]
    ScorerFailed(String),

    #[error("request cancelled: client is shutting down")]
    Cancelled,

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    detail: String,
}

impl IntoResponse for FirewallError {
    fn into_response(self) -> Response {
        let status = match &self {
            FirewallError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            FirewallError::PolicyConflict(_) => StatusCode::CONFLICT,
            FirewallError::ConnectionNotFound(_) => StatusCode::NOT_FOUND,
            FirewallError::ScorerFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            FirewallError::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
            FirewallError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            FirewallError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let detail = self.to_string();
        (status, Json(ErrorBody { detail })).into_response()
    }
}
