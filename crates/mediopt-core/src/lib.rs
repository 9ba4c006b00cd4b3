//! Mediopt Core Library
//!
//! This crate provides the configuration, error taxonomy and shared models used by
//! the storage, processing and API crates.

pub mod config;
pub mod error;
pub mod models;
pub mod storage_types;

// Re-export commonly used types
pub use config::{Config, OptimizerConfig};
pub use error::{ErrorMetadata, LogLevel, PipelineError};
pub use models::{
    ImageProfile, MediaKind, PipelineOutcome, StageState, TransformProfile, UploadResult,
    VideoProfile,
};
pub use storage_types::StorageBackend;
