use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use script_exporter_core::error::{ExecError, ExecErrorKind, ParseError, ServeError};

/// Application-level error type for HTTP handlers.
///
/// Wraps the core error families and implements [`IntoResponse`] to produce
/// consistent JSON error responses.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// The script could not be admitted or did not run cleanly.
    #[error(transparent)]
    Exec(#[from] ExecError),

    /// The script ran but its output is not valid metrics.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// The response could not be assembled or encoded.
    #[error(transparent)]
    Serve(#[from] ServeError),

    /// A bad request with a human-readable message.
    #[error("Bad request: {0}")]
    BadRequest(String),
}

/// Convenience type alias for handler return values.
pub type AppResult<T> = Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Exec(err) => match err.kind() {
                ExecErrorKind::AdmissionRejected => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "CONCURRENCY_EXCEEDED",
                    err.to_string(),
                ),
                ExecErrorKind::ExecutionFailed => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "SCRIPT_FAILED",
                    err.to_string(),
                ),
                ExecErrorKind::TimedOut => {
                    (StatusCode::GATEWAY_TIMEOUT, "SCRIPT_TIMEOUT", err.to_string())
                }
                ExecErrorKind::Cancelled => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "SCRIPT_CANCELLED",
                    err.to_string(),
                ),
                ExecErrorKind::InvalidRequest => {
                    (StatusCode::BAD_REQUEST, "BAD_REQUEST", err.to_string())
                }
            },

            AppError::Parse(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "PARSE_ERROR",
                err.to_string(),
            ),

            AppError::Serve(err) => {
                tracing::error!(error = %err, "Failed to serve metrics");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }

            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
        };

        let body = json!({
            "error": message,
            "code": code,
        });

        (status, axum::Json(body)).into_response()
    }
}
