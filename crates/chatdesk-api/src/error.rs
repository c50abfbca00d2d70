//! API error responses

use axum::{http::StatusCode, Json};
use chatdesk_core::BlastError;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// Rejection returned by every handler
pub type ApiError = (StatusCode, Json<ErrorResponse>);

pub fn api_error(status: StatusCode, error: &str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            message: message.into(),
        }),
    )
}

pub fn validation_error(message: impl Into<String>) -> ApiError {
    api_error(StatusCode::UNPROCESSABLE_ENTITY, "validation_error", message)
}

/// Map an engine error, logging server-side failures.
/// Storage details never reach the client.
pub fn engine_error(context: &str, e: BlastError) -> ApiError {
    let status =
        StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    if status.is_server_error() && !matches!(e, BlastError::Generation(_)) {
        error!("{}: {}", context, e);
        return api_error(status, "internal_error", format!("{} failed", context));
    }

    warn!("{}: {}", context, e);
    api_error(status, &e.code().to_lowercase(), e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_transition_errors_are_conflicts() {
        let (status, Json(body)) = engine_error(
            "Pause campaign",
            BlastError::InvalidTransition {
                entity: "campaign",
                from: "completed".to_string(),
                action: "pause",
            },
        );
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body.error, "invalid_transition");
        assert_eq!(body.message, "Cannot pause campaign in status 'completed'");
    }

    #[test]
    fn test_storage_errors_are_hidden() {
        let (status, Json(body)) = engine_error(
            "List campaigns",
            BlastError::Storage(chatdesk_common::Error::Database("password leaked".to_string())),
        );
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!body.message.contains("password"));
    }
}
