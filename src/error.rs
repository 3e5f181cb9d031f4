use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Application-wide error types with appropriate HTTP status codes.
///
/// # Throttling
///
/// `Throttled` is rendered with its own body shape,
/// `{"error": <message>, "retryAfter": <seconds>}`, which browser clients of
/// the exam platform already parse. Every other variant uses [`ErrorResponse`].
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Rate limit exceeded: {message} (retry after {retry_after_secs}s)")]
    Throttled {
        message: String,
        retry_after_secs: u64,
    },

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Error response body for API endpoints.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

/// Body returned with HTTP 429.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThrottledBody {
    pub error: String,
    pub retry_after: u64,
}

impl AppError {
    /// Build a throttling error from a policy message and the remaining window.
    pub fn throttled(message: impl Into<String>, retry_after_secs: u64) -> Self {
        AppError::Throttled {
            message: message.into(),
            retry_after_secs,
        }
    }

    /// HTTP status this error maps to.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Throttled { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Internal(_) | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let (error_type, message) = match self {
            AppError::Throttled {
                message,
                retry_after_secs,
            } => {
                // Logged by the rate limiter with client context, not here.
                let body = ThrottledBody {
                    error: message,
                    retry_after: retry_after_secs,
                };
                return (status, axum::Json(body)).into_response();
            }
            AppError::NotFound(msg) => ("not_found", msg),
            // Internal errors - never expose internal details to clients
            AppError::Internal(msg) => {
                tracing::error!(error = %msg, "Request failed");
                (
                    "internal_error",
                    "An internal error occurred. Please contact support if the issue persists."
                        .to_string(),
                )
            }
            AppError::ConfigError(msg) => {
                tracing::error!(error = %msg, "Configuration error surfaced in request");
                (
                    "config_error",
                    "Service configuration error. Please contact support.".to_string(),
                )
            }
        };

        let body = ErrorResponse {
            error: error_type.to_string(),
            message,
        };

        (status, axum::Json(body)).into_response()
    }
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;
