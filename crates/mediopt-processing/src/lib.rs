//! Mediopt Media Processing Library
//!
//! This crate provides the streaming optimize-and-upload pipeline and the codec
//! adapters that plug into it: WebP for still images and an encoder subprocess
//! for video.

pub mod error;
pub mod pipeline;

#[cfg(feature = "image")]
pub mod image;

#[cfg(feature = "video")]
pub mod video;

// Re-export commonly used types
pub use error::TransformError;
pub use pipeline::{
    ByteSource, ChunkSink, IngestError, IngestEvent, MediaTransform, PipelineController,
    PipelineHandle, PipelineReport, PipelineRequest, PipelineSettings, PipelineState,
    ResponseGate, Stage, StageStates, TransformIo, TransformMonitor, TransformSummary,
};

#[cfg(feature = "image")]
pub use self::image::ImageTransform;

#[cfg(feature = "video")]
pub use self::video::VideoTransform;
