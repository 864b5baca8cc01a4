//! Engine error taxonomy
//!
//! Internals work with `anyhow::Result`; anything crossing the engine boundary
//! is folded into [`EngineError`] so the HTTP layer can pick a status code
//! without inspecting messages.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// Rejected request. The message is returned to the client verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed request or unknown runtime
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Every sandbox slot is busy and the wait queue is full
    #[error("sandbox pool exhausted ({waiting} jobs already waiting)")]
    ResourceExhausted { waiting: usize },

    /// Priming, spawning or I/O failure in the engine itself
    #[error("execution infrastructure failure: {0:#}")]
    Infrastructure(anyhow::Error),

    /// Sandbox could not be reset after a job
    #[error("sandbox cleanup failed: {0:#}")]
    Cleanup(anyhow::Error),
}

impl EngineError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            EngineError::Validation(_) => StatusCode::BAD_REQUEST,
            EngineError::ResourceExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Infrastructure(_) | EngineError::Cleanup(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match self {
            EngineError::Validation(e) => {
                (status, Json(json!({ "message": e.0 }))).into_response()
            }
            EngineError::ResourceExhausted { .. } => {
                (status, Json(json!({ "message": self.to_string() }))).into_response()
            }
            // Infrastructure details stay in the logs
            EngineError::Infrastructure(_) | EngineError::Cleanup(_) => {
                error!("{}", self);
                status.into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            EngineError::from(ValidationError::new("bad")).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            EngineError::ResourceExhausted { waiting: 3 }.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            EngineError::Cleanup(anyhow::anyhow!("box busy")).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_validation_message_is_verbatim() {
        let err = EngineError::from(ValidationError::new("version is required as a string"));
        assert_eq!(err.to_string(), "version is required as a string");
    }
}
