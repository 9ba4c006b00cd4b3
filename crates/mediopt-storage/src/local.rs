use crate::keys::validate_key;
use crate::multipart::MultipartSink;
use crate::traits::{Storage, StorageError, StorageResult, UploadSink};
use crate::StorageBackend;
use async_trait::async_trait;
use object_store::local::LocalFileSystem;
use object_store::path::Path as ObjectPath;
use object_store::Error as ObjectStoreError;
use object_store::ObjectStoreExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;

/// Local filesystem storage implementation
///
/// Uploads are staged next to their destination and renamed into place on
/// `finish`, so an aborted upload never shows up under its key.
#[derive(Clone)]
pub struct LocalStorage {
    store: Arc<LocalFileSystem>,
    base_path: PathBuf,
    base_url: String,
    chunk_size: usize,
    max_concurrency: usize,
}

impl LocalStorage {
    /// Create a new LocalStorage instance
    ///
    /// # Arguments
    /// * `base_path` - Root directory for file storage (e.g., "/var/lib/mediopt/media")
    /// * `base_url` - Base URL for serving files (e.g., "http://localhost:4000/media")
    pub async fn new(base_path: impl Into<PathBuf>, base_url: String) -> StorageResult<Self> {
        let base_path = base_path.into();

        fs::create_dir_all(&base_path).await.map_err(|e| {
            StorageError::ConfigError(format!(
                "Failed to create storage directory {}: {}",
                base_path.display(),
                e
            ))
        })?;

        let store = LocalFileSystem::new_with_prefix(&base_path)
            .map_err(|e| StorageError::ConfigError(e.to_string()))?;

        Ok(LocalStorage {
            store: Arc::new(store),
            base_path,
            base_url,
            chunk_size: 1024 * 1024,
            max_concurrency: 4,
        })
    }

    /// Override part size and in-flight parts.
    pub fn with_upload_limits(mut self, chunk_size: usize, max_concurrency: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn base_path(&self) -> &PathBuf {
        &self.base_path
    }

    /// Generate public URL for file
    fn generate_url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), key)
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn begin_upload(
        &self,
        storage_key: &str,
        content_type: &str,
    ) -> StorageResult<Box<dyn UploadSink>> {
        validate_key(storage_key)?;
        let location = ObjectPath::from(storage_key.to_string());

        // LocalFileSystem rejects object attributes, so the content type is not stored.
        let upload = self.store.put_multipart(&location).await.map_err(|e| {
            tracing::error!(
                error = %e,
                path = %self.base_path.display(),
                key = %storage_key,
                "Local upload could not be created"
            );
            StorageError::UploadFailed(e.to_string())
        })?;

        tracing::debug!(
            key = %storage_key,
            content_type = %content_type,
            "Local upload started"
        );

        Ok(Box::new(MultipartSink::new(
            upload,
            self.chunk_size,
            storage_key.to_string(),
            self.generate_url(storage_key),
            StorageBackend::Local,
            self.max_concurrency,
        )))
    }

    fn public_url(&self, storage_key: &str) -> String {
        self.generate_url(storage_key)
    }

    async fn delete(&self, storage_key: &str) -> StorageResult<()> {
        validate_key(storage_key)?;
        let location = ObjectPath::from(storage_key.to_string());
        match self.store.delete(&location).await {
            Ok(()) => {
                tracing::info!(key = %storage_key, "Local delete successful");
                Ok(())
            }
            Err(ObjectStoreError::NotFound { .. }) => Ok(()),
            Err(e) => Err(StorageError::DeleteFailed(e.to_string())),
        }
    }

    async fn exists(&self, storage_key: &str) -> StorageResult<bool> {
        validate_key(storage_key)?;
        let location = ObjectPath::from(storage_key.to_string());
        match self.store.head(&location).await {
            Ok(_) => Ok(true),
            Err(ObjectStoreError::NotFound { .. }) => Ok(false),
            Err(e) => Err(StorageError::BackendError(e.to_string())),
        }
    }

    fn backend_type(&self) -> StorageBackend {
        StorageBackend::Local
    }
}
