//! Streaming upload sink shared by every `object_store` backend.

use std::mem;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use object_store::{MultipartUpload, PutPayloadMut};
use tokio::task::JoinSet;

use crate::traits::{StorageError, StorageResult, UploadReceipt, UploadSink};
use crate::StorageBackend;

/// Multipart upload fed chunk by chunk.
///
/// Data is accumulated into parts of `chunk_size` bytes; at most
/// `max_concurrency` parts are in flight before `write` waits. The upload handle
/// stays owned by the sink until it completes, so an interrupted `finish` can
/// still be followed by `abort`.
pub struct MultipartSink {
    upload: Box<dyn MultipartUpload>,
    buffer: PutPayloadMut,
    parts: JoinSet<object_store::Result<()>>,
    chunk_size: usize,
    max_concurrency: usize,
    key: String,
    url: String,
    backend: StorageBackend,
    bytes_written: u64,
    completed: bool,
    started: Instant,
}

impl MultipartSink {
    pub fn new(
        upload: Box<dyn MultipartUpload>,
        chunk_size: usize,
        key: String,
        url: String,
        backend: StorageBackend,
        max_concurrency: usize,
    ) -> Self {
        Self {
            upload,
            buffer: PutPayloadMut::new(),
            parts: JoinSet::new(),
            chunk_size: chunk_size.max(1),
            max_concurrency: max_concurrency.max(1),
            key,
            url,
            backend,
            bytes_written: 0,
            completed: false,
            started: Instant::now(),
        }
    }

    /// Wait until at most `max` parts are in flight.
    async fn wait_for_capacity(&mut self, max: usize) -> StorageResult<()> {
        while self.parts.len() > max {
            if let Some(joined) = self.parts.join_next().await {
                joined
                    .map_err(|e| StorageError::UploadFailed(format!("part upload task failed: {}", e)))?
                    .map_err(|e| {
                        tracing::error!(
                            error = %e,
                            backend = %self.backend,
                            key = %self.key,
                            size_bytes = self.bytes_written,
                            "Multipart part upload failed"
                        );
                        StorageError::UploadFailed(e.to_string())
                    })?;
            }
        }
        Ok(())
    }

    async fn flush_part(&mut self) -> StorageResult<()> {
        self.wait_for_capacity(self.max_concurrency - 1).await?;
        let payload = mem::take(&mut self.buffer).freeze();
        let part = self.upload.put_part(payload);
        self.parts.spawn(part);
        Ok(())
    }
}

#[async_trait]
impl UploadSink for MultipartSink {
    async fn write(&mut self, mut chunk: Bytes) -> StorageResult<()> {
        self.bytes_written += chunk.len() as u64;
        while !chunk.is_empty() {
            let remaining = self.chunk_size - self.buffer.content_length();
            if chunk.len() < remaining {
                self.buffer.push(chunk);
                return Ok(());
            }
            self.buffer.push(chunk.split_to(remaining));
            self.flush_part().await?;
        }
        Ok(())
    }

    async fn finish(&mut self) -> StorageResult<UploadReceipt> {
        if !self.buffer.is_empty() {
            self.flush_part().await?;
        }
        self.wait_for_capacity(0).await?;

        let result = self.upload.complete().await.map_err(|e| {
            tracing::error!(
                error = %e,
                backend = %self.backend,
                key = %self.key,
                size_bytes = self.bytes_written,
                duration_ms = self.started.elapsed().as_secs_f64() * 1000.0,
                "Multipart upload failed"
            );
            StorageError::UploadFailed(e.to_string())
        })?;
        self.completed = true;

        tracing::info!(
            backend = %self.backend,
            key = %self.key,
            size_bytes = self.bytes_written,
            duration_ms = self.started.elapsed().as_secs_f64() * 1000.0,
            "Multipart upload successful"
        );

        Ok(UploadReceipt {
            key: self.key.clone(),
            url: self.url.clone(),
            size_bytes: self.bytes_written,
            e_tag: result.e_tag,
        })
    }

    async fn abort(&mut self) -> StorageResult<()> {
        if self.completed {
            return Ok(());
        }
        self.parts.abort_all();
        while self.parts.join_next().await.is_some() {}

        self.upload.abort().await.map_err(|e| {
            tracing::warn!(
                error = %e,
                backend = %self.backend,
                key = %self.key,
                "Multipart abort failed"
            );
            StorageError::BackendError(e.to_string())
        })?;

        tracing::debug!(
            backend = %self.backend,
            key = %self.key,
            size_bytes = self.bytes_written,
            "Multipart upload aborted"
        );
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}
