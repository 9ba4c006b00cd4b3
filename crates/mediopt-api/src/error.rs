//! HTTP error response conversion
//!
//! Handlers return `Result<_, HttpAppError>`; every pipeline failure renders as
//! `{success: false, message}` with the status its kind maps to.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use mediopt_core::{ErrorMetadata, LogLevel, PipelineError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Wrapper type for PipelineError to implement IntoResponse
/// This is necessary because of Rust's orphan rules - we can't implement
/// IntoResponse (external trait) for PipelineError (external type from mediopt-core)
#[derive(Debug)]
pub struct HttpAppError(pub PipelineError);

impl From<PipelineError> for HttpAppError {
    fn from(err: PipelineError) -> Self {
        HttpAppError(err)
    }
}

impl From<anyhow::Error> for HttpAppError {
    fn from(err: anyhow::Error) -> Self {
        HttpAppError(PipelineError::Unexpected(err.to_string()))
    }
}

fn log_error(error: &PipelineError) {
    let error_type = error.error_type();
    match error.log_level() {
        LogLevel::Debug => {
            tracing::debug!(error = %error, error_type = error_type, "Request failed");
        }
        LogLevel::Warn => {
            tracing::warn!(error = %error, error_type = error_type, "Request failed");
        }
        LogLevel::Error => {
            tracing::error!(error = %error, error_type = error_type, "Request failed");
        }
    }
}

impl IntoResponse for HttpAppError {
    fn into_response(self) -> Response {
        let error = &self.0;
        let status = StatusCode::from_u16(error.http_status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        log_error(error);

        (status, Json(ErrorResponse::new(error.client_message()))).into_response()
    }
}
