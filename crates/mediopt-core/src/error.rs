//! Error types module
//!
//! Every failure a pipeline can end with is one of the `PipelineError` variants.
//! Stage-local errors (storage, codec, transport) are classified into this enum at the
//! stage boundary; the HTTP layer only ever sees `PipelineError`.

/// Log level for error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug level - for expected outcomes like a caller hanging up
    Debug,
    /// Warning level - for bad input
    Warn,
    /// Error level - for unexpected failures
    Error,
}

/// Metadata for error responses - defines how an error should be presented
/// This trait allows errors to self-describe their HTTP response characteristics
pub trait ErrorMetadata {
    /// HTTP status code to return
    fn http_status_code(&self) -> u16;

    /// Machine-readable error code (e.g., "TRANSFORM_ERROR")
    fn error_code(&self) -> &'static str;

    /// Client-facing message (may differ from internal error message)
    fn client_message(&self) -> String;

    /// Log level for this error
    fn log_level(&self) -> LogLevel;
}

/// HTTP status used when the caller closed the connection mid-upload.
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("Ingest transport error: {0}")]
    IngestTransport(String),

    #[error("Client canceled the upload")]
    ClientCanceled,

    #[error("Transform error: {0}")]
    Transform(String),

    #[error("Egress error: {0}")]
    Egress(String),

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

/// Static metadata for each variant: (http_status, error_code, log_level).
fn pipeline_error_static_metadata(err: &PipelineError) -> (u16, &'static str, LogLevel) {
    match err {
        PipelineError::IngestTransport(_) => (500, "INGEST_TRANSPORT_ERROR", LogLevel::Warn),
        PipelineError::ClientCanceled => (CLIENT_CLOSED_REQUEST, "CLIENT_CANCELED", LogLevel::Debug),
        PipelineError::Transform(_) => (500, "TRANSFORM_ERROR", LogLevel::Warn),
        PipelineError::Egress(_) => (500, "EGRESS_ERROR", LogLevel::Error),
        PipelineError::Unexpected(_) => (500, "INTERNAL_ERROR", LogLevel::Error),
    }
}

impl PipelineError {
    /// Get the error type name for logs
    pub fn error_type(&self) -> &'static str {
        match self {
            PipelineError::IngestTransport(_) => "IngestTransportError",
            PipelineError::ClientCanceled => "ClientCanceled",
            PipelineError::Transform(_) => "TransformError",
            PipelineError::Egress(_) => "EgressError",
            PipelineError::Unexpected(_) => "UnexpectedError",
        }
    }
}

impl ErrorMetadata for PipelineError {
    fn http_status_code(&self) -> u16 {
        pipeline_error_static_metadata(self).0
    }

    fn error_code(&self) -> &'static str {
        pipeline_error_static_metadata(self).1
    }

    fn log_level(&self) -> LogLevel {
        pipeline_error_static_metadata(self).2
    }

    fn client_message(&self) -> String {
        match self {
            PipelineError::IngestTransport(_) => "upload stream failed".to_string(),
            PipelineError::ClientCanceled => "Upload canceled".to_string(),
            PipelineError::Transform(_) => "processing failed".to_string(),
            PipelineError::Egress(_) => "upload failed".to_string(),
            PipelineError::Unexpected(_) => "internal server error".to_string(),
        }
    }
}
