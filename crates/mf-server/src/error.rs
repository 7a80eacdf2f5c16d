//! Error-to-HTTP response conversion.
//!
//! Implements `IntoResponse` for [`mf_core::Error`] so that route handlers
//! can return `Result<T, AppError>` and use `?` on core results.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use mf_core::{Error, Rejection};
use serde_json::json;

/// Wrapper so we can implement `IntoResponse` for an external type.
///
/// Clients correlate a hidden 5xx detail with the server log through the
/// `x-request-id` response header; the log line is emitted inside the
/// request's span.
#[derive(Debug)]
pub struct AppError {
    inner: Error,
}

impl AppError {
    pub fn new(inner: Error) -> Self {
        Self { inner }
    }

    /// Machine-readable error code.
    fn code(&self) -> &'static str {
        match &self.inner {
            Error::NotFound { .. } => "not_found",
            Error::Validation(_) => "validation_error",
            Error::AdmissionRejected(Rejection::UnsupportedExtension(_)) => "unsupported_extension",
            Error::AdmissionRejected(Rejection::TooLarge { .. }) => "file_too_large",
            Error::NotReady(_) => "not_ready",
            Error::Expired(_) => "result_expired",
            Error::InvalidTransition(_) => "conflict",
            Error::Database { .. } => "database_error",
            Error::Io { .. } => "io_error",
            Error::Storage(_) => "storage_error",
            Error::Tool { .. } => "tool_error",
            Error::Pipeline { .. } => "pipeline_error",
            Error::Config(_) => "config_error",
            Error::Internal(_) => "internal_error",
        }
    }
}

impl From<Error> for AppError {
    fn from(e: Error) -> Self {
        Self::new(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.inner.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        // Server-side detail stays in the log.
        let message = if status.is_server_error() {
            tracing::error!(
                status = %status,
                error = %self.inner,
                "Server error in API handler"
            );
            "internal server error".to_string()
        } else {
            self.inner.to_string()
        };

        let body = json!({
            "error": message,
            "code": self.code(),
        });

        (status, axum::Json(body)).into_response()
    }
}
