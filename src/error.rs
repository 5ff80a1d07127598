//! Typed error taxonomy shared by the registry, generation manager and
//! sandboxed action surface, projected onto HTTP status codes at the
//! surface layer: registry/generation operations surface typed errors,
//! the HTTP layer maps them to responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// A single error kind shared across every component of the service.
///
/// Each variant carries its own HTTP projection so handlers never have
/// to guess a status code from a message string.
#[derive(Debug, thiserror::Error)]
pub enum JarvisError {
    #[error("{0}")]
    Validation(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("{0}")]
    Authorization(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Cancelled(String),

    #[error("{0}")]
    Internal(String),

    #[error("No model is currently loaded")]
    NotLoaded,

    #[error("Command timed out")]
    Timeout,

    #[error("{0}")]
    UpstreamFailure(String),
}

impl JarvisError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            JarvisError::Validation(_) => StatusCode::BAD_REQUEST,
            JarvisError::Unauthorized => StatusCode::UNAUTHORIZED,
            JarvisError::Authorization(_) => StatusCode::FORBIDDEN,
            JarvisError::NotFound(_) => StatusCode::NOT_FOUND,
            JarvisError::Conflict(_) => StatusCode::CONFLICT,
            JarvisError::Cancelled(_) => StatusCode::from_u16(499).unwrap(),
            JarvisError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            JarvisError::NotLoaded => StatusCode::SERVICE_UNAVAILABLE,
            JarvisError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            JarvisError::UpstreamFailure(_) => StatusCode::BAD_GATEWAY,
            // Duplicated explicitly rather than derived via a wildcard, so a new
            // variant missing a status code fails to compile.
        }
    }

    /// Numeric error code as persisted in a `ProgressRecord`.
    pub fn error_code(&self) -> u16 {
        self.status_code().as_u16()
    }
}

#[derive(Serialize)]
struct ErrorBody {
    detail: String,
}

impl IntoResponse for JarvisError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let detail = self.to_string();
        tracing::warn!(status = status.as_u16(), %detail, "request failed");
        (status, Json(ErrorBody { detail })).into_response()
    }
}

pub type Result<T> = std::result::Result<T, JarvisError>;
