//! Errors raised inside a transform stage.

use std::process::ExitStatus;

use mediopt_core::PipelineError;

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    /// Upstream stopped feeding without an end-of-input marker.
    #[error("input ended before end-of-input marker")]
    InputAborted,

    /// Teardown was requested while the stage was running.
    #[error("transform canceled")]
    Canceled,

    /// The egress side went away; its own error is the one reported.
    #[error("output channel closed")]
    OutputClosed,

    #[error("Input too large: {size} bytes exceeds limit of {limit} bytes")]
    InputTooLarge { size: usize, limit: usize },

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Encode failed: {0}")]
    Encode(String),

    #[error("Failed to spawn encoder: {0}")]
    Spawn(String),

    #[error("Encoder exited with {status}: {detail}")]
    Exited { status: ExitStatus, detail: String },

    #[error("Encoder stopped reading input before end of stream")]
    InputRejected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid encoder configuration: {0}")]
    Config(String),
}

impl TransformError {
    /// True for endings caused by another stage rather than by this one.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            TransformError::InputAborted | TransformError::Canceled | TransformError::OutputClosed
        )
    }
}

impl From<TransformError> for PipelineError {
    fn from(err: TransformError) -> Self {
        PipelineError::Transform(err.to_string())
    }
}
