//! Storage setup and initialization

use anyhow::{Context, Result};
use mediopt_core::Config;
use mediopt_storage::{create_storage, Storage};
use std::sync::Arc;

pub async fn setup_storage(config: &Config) -> Result<Arc<dyn Storage>> {
    tracing::info!("Initializing storage backend...");
    let storage = create_storage(config)
        .await
        .context("Failed to initialize storage backend")?;
    tracing::info!(
        backend = %storage.backend_type(),
        bucket = ?config.s3_bucket(),
        local_path = ?config.local_storage_path(),
        chunk_size = config.upload_chunk_size(),
        max_concurrency = config.upload_max_concurrency(),
        "Storage backend initialized"
    );
    Ok(storage)
}
