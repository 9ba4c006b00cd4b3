//! Mediopt Storage Library
//!
//! Streaming egress to object storage. Every backend hands out an [`UploadSink`]
//! that accepts transformed bytes incrementally and is either finished (object
//! becomes visible) or aborted (nothing is left behind).
//!
//! # Storage key format
//!
//! Keys are `{folder}/{uuid}.{extension}`; the public id is the key without the
//! extension. Keys must not contain `..` or a leading `/`. Key generation is
//! centralized in the `keys` module so all backends stay consistent.

pub mod factory;
pub mod keys;
pub mod local;
pub mod multipart;
pub mod s3;
pub mod traits;

// Re-export commonly used types
pub use factory::create_storage;
pub use keys::{generate_storage_key, StorageKey};
pub use local::LocalStorage;
pub use mediopt_core::StorageBackend;
pub use multipart::MultipartSink;
pub use s3::S3Storage;
pub use traits::{Storage, StorageError, StorageResult, UploadReceipt, UploadSink};
