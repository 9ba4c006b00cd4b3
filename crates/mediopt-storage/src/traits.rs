//! Storage abstraction traits
//!
//! `Storage` opens uploads; `UploadSink` is the write half of one upload.

use crate::StorageBackend;
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Storage operation errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Delete failed: {0}")]
    DeleteFailed(String),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("Storage backend error: {0}")]
    BackendError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Acknowledgment returned by the backend once an upload is complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub key: String,
    pub url: String,
    pub size_bytes: u64,
    pub e_tag: Option<String>,
}

/// Write half of an in-progress upload.
///
/// `write` applies back-pressure: it does not return until the backend has room
/// for more data. Dropping a sink without a successful `finish` or an `abort`
/// leaves the cleanup to the backend, so callers always end with one of the two.
/// `abort` stays valid after a failed or interrupted `finish`.
#[async_trait]
pub trait UploadSink: Send {
    async fn write(&mut self, chunk: Bytes) -> StorageResult<()>;

    /// Complete the upload and make the object visible.
    async fn finish(&mut self) -> StorageResult<UploadReceipt>;

    /// Discard everything written so far.
    async fn abort(&mut self) -> StorageResult<()>;

    /// Bytes accepted so far.
    fn bytes_written(&self) -> u64;
}

/// Storage abstraction trait
///
/// All storage backends (S3, local filesystem) implement this trait, so the
/// pipeline can stream into any of them without knowing which one it is.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Start a streaming upload to `storage_key`.
    async fn begin_upload(
        &self,
        storage_key: &str,
        content_type: &str,
    ) -> StorageResult<Box<dyn UploadSink>>;

    /// Public URL the object will be served from.
    fn public_url(&self, storage_key: &str) -> String;

    /// Delete a file by its storage key
    async fn delete(&self, storage_key: &str) -> StorageResult<()>;

    /// Check if a file exists
    async fn exists(&self, storage_key: &str) -> StorageResult<bool>;

    /// Get the storage backend type
    fn backend_type(&self) -> StorageBackend;
}
