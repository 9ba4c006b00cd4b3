//! Configuration module
//!
//! Settings are read from the environment (a `.env` file is loaded first when present)
//! and validated once at startup.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::models::{ImageProfile, VideoProfile};
use crate::storage_types::StorageBackend;

const SERVER_PORT: u16 = 4000;
const IMAGE_MAX_DIMENSION: u32 = 1080;
const IMAGE_QUALITY: f32 = 70.0;
const MAX_IMAGE_SIZE_MB: usize = 25;
const VIDEO_MAX_WIDTH: u32 = 1280;
const VIDEO_CRF: u8 = 28;
const VIDEO_PRESET: &str = "veryfast";
const UPLOAD_TIMEOUT_SECS: u64 = 600;
const UPLOAD_CHUNK_SIZE: usize = 6_000_000;
const UPLOAD_MAX_CONCURRENCY: usize = 4;
const PIPELINE_BUFFER_CHUNKS: usize = 8;

/// Smallest part size S3 accepts for every part but the last.
const S3_MIN_PART_SIZE: usize = 5 * 1024 * 1024;

const X264_PRESETS: &[&str] = &[
    "ultrafast",
    "superfast",
    "veryfast",
    "faster",
    "fast",
    "medium",
    "slow",
    "slower",
    "veryslow",
];

/// Server-level settings
#[derive(Clone, Debug)]
pub struct BaseConfig {
    pub server_port: u16,
    pub cors_origins: Vec<String>,
    pub environment: String,
    pub log_format: String,
}

/// Optimizer configuration
#[derive(Clone, Debug)]
pub struct OptimizerConfig {
    pub base: BaseConfig,
    // Storage configuration
    pub storage_backend: Option<StorageBackend>,
    pub s3_bucket: Option<String>,
    pub s3_region: Option<String>,
    pub s3_endpoint: Option<String>, // Custom endpoint for S3-compatible providers (MinIO, R2, etc.)
    pub aws_region: Option<String>,
    pub local_storage_path: Option<String>,
    pub local_storage_base_url: Option<String>,
    pub image_folder: String,
    pub video_folder: String,
    // Transform configuration
    pub image_max_dimension: u32,
    pub image_quality: f32,
    pub max_image_size_bytes: usize,
    pub video_max_width: u32,
    pub video_crf: u8,
    pub video_preset: String,
    pub ffmpeg_path: String,
    /// Piped input cannot demux MP4/MOV files whose moov atom trails the media
    /// data (typical phone recordings); spooling to disk handles them.
    pub video_spool_input: bool,
    pub temp_dir: PathBuf,
    // Egress configuration
    pub upload_timeout_secs: u64,
    pub upload_chunk_size: usize,
    pub upload_max_concurrency: usize,
    pub pipeline_buffer_chunks: usize,
}

/// Application configuration.
#[derive(Clone, Debug)]
pub struct Config(pub Box<OptimizerConfig>);

impl Config {
    fn inner(&self) -> &OptimizerConfig {
        &self.0
    }

    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();
        let config = OptimizerConfig::from_lookup(|key| env::var(key).ok())?;
        Ok(Config(Box::new(config)))
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        self.inner().validate()
    }

    pub fn server_port(&self) -> u16 {
        self.inner().base.server_port
    }

    pub fn cors_origins(&self) -> &[String] {
        &self.inner().base.cors_origins
    }

    pub fn environment(&self) -> &str {
        &self.inner().base.environment
    }

    pub fn log_format(&self) -> &str {
        &self.inner().base.log_format
    }

    pub fn storage_backend(&self) -> StorageBackend {
        self.inner().storage_backend.unwrap_or(StorageBackend::S3)
    }

    pub fn s3_bucket(&self) -> Option<&str> {
        self.inner().s3_bucket.as_deref()
    }

    /// S3 region, falling back to `AWS_REGION`.
    pub fn s3_region(&self) -> Option<&str> {
        self.inner()
            .s3_region
            .as_deref()
            .or(self.inner().aws_region.as_deref())
    }

    pub fn s3_endpoint(&self) -> Option<&str> {
        self.inner().s3_endpoint.as_deref()
    }

    pub fn local_storage_path(&self) -> Option<&str> {
        self.inner().local_storage_path.as_deref()
    }

    pub fn local_storage_base_url(&self) -> Option<&str> {
        self.inner().local_storage_base_url.as_deref()
    }

    pub fn image_folder(&self) -> &str {
        &self.inner().image_folder
    }

    pub fn video_folder(&self) -> &str {
        &self.inner().video_folder
    }

    pub fn image_profile(&self) -> ImageProfile {
        ImageProfile {
            max_dimension: self.inner().image_max_dimension,
            quality: self.inner().image_quality,
            max_input_bytes: self.inner().max_image_size_bytes,
        }
    }

    pub fn video_profile(&self) -> VideoProfile {
        VideoProfile {
            max_width: self.inner().video_max_width,
            crf: self.inner().video_crf,
            preset: self.inner().video_preset.clone(),
            ..VideoProfile::default()
        }
    }

    pub fn ffmpeg_path(&self) -> &str {
        &self.inner().ffmpeg_path
    }

    pub fn video_spool_input(&self) -> bool {
        self.inner().video_spool_input
    }

    pub fn temp_dir(&self) -> &PathBuf {
        &self.inner().temp_dir
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.inner().upload_timeout_secs)
    }

    pub fn upload_chunk_size(&self) -> usize {
        self.inner().upload_chunk_size
    }

    pub fn upload_max_concurrency(&self) -> usize {
        self.inner().upload_max_concurrency
    }

    pub fn pipeline_buffer_chunks(&self) -> usize {
        self.inner().pipeline_buffer_chunks
    }
}

fn is_production_env(environment: &str) -> bool {
    let env = environment.to_lowercase();
    env == "production" || env == "prod"
}

impl OptimizerConfig {
    /// Build the configuration from a key lookup. `Config::from_env` passes the
    /// process environment; tests pass a map.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, anyhow::Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let environment = lookup("ENVIRONMENT")
            .or_else(|| lookup("APP_ENV"))
            .unwrap_or_else(|| "development".to_string());

        let cors_origins_str = lookup("CORS_ORIGINS").unwrap_or_else(|| "*".to_string());
        if is_production_env(&environment) && cors_origins_str.trim() == "*" {
            return Err(anyhow::anyhow!(
                "CORS_ORIGINS cannot be '*' in production. Please specify explicit origins."
            ));
        }

        let cors_origins: Vec<String> = cors_origins_str
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let base = BaseConfig {
            server_port: lookup("PORT")
                .unwrap_or_else(|| SERVER_PORT.to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT must be a valid number"))?,
            cors_origins,
            environment,
            log_format: lookup("LOG_FORMAT").unwrap_or_else(|| "compact".to_string()),
        };

        let storage_backend = match lookup("STORAGE_BACKEND") {
            Some(s) => Some(s.parse::<StorageBackend>()?),
            None => None,
        };

        let max_image_size_mb = lookup("MAX_IMAGE_SIZE_MB")
            .unwrap_or_else(|| MAX_IMAGE_SIZE_MB.to_string())
            .parse::<usize>()
            .unwrap_or(MAX_IMAGE_SIZE_MB);

        let config = OptimizerConfig {
            base,
            storage_backend,
            s3_bucket: lookup("S3_BUCKET"),
            s3_region: lookup("S3_REGION"),
            s3_endpoint: lookup("S3_ENDPOINT"),
            aws_region: lookup("AWS_REGION"),
            local_storage_path: lookup("LOCAL_STORAGE_PATH"),
            local_storage_base_url: lookup("LOCAL_STORAGE_BASE_URL"),
            image_folder: lookup("IMAGE_FOLDER").unwrap_or_else(|| "optimized/images".to_string()),
            video_folder: lookup("VIDEO_FOLDER").unwrap_or_else(|| "optimized/videos".to_string()),
            image_max_dimension: lookup("IMAGE_MAX_DIMENSION")
                .unwrap_or_else(|| IMAGE_MAX_DIMENSION.to_string())
                .parse()
                .unwrap_or(IMAGE_MAX_DIMENSION),
            image_quality: lookup("IMAGE_QUALITY")
                .unwrap_or_else(|| IMAGE_QUALITY.to_string())
                .parse()
                .unwrap_or(IMAGE_QUALITY),
            max_image_size_bytes: max_image_size_mb * 1024 * 1024,
            video_max_width: lookup("VIDEO_MAX_WIDTH")
                .unwrap_or_else(|| VIDEO_MAX_WIDTH.to_string())
                .parse()
                .unwrap_or(VIDEO_MAX_WIDTH),
            video_crf: lookup("VIDEO_CRF")
                .unwrap_or_else(|| VIDEO_CRF.to_string())
                .parse()
                .unwrap_or(VIDEO_CRF),
            video_preset: lookup("VIDEO_PRESET").unwrap_or_else(|| VIDEO_PRESET.to_string()),
            ffmpeg_path: lookup("FFMPEG_PATH").unwrap_or_else(|| "ffmpeg".to_string()),
            video_spool_input: lookup("VIDEO_SPOOL_INPUT")
                .unwrap_or_else(|| "false".to_string())
                .parse()
                .unwrap_or(false),
            temp_dir: lookup("TEMP_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(env::temp_dir),
            upload_timeout_secs: lookup("UPLOAD_TIMEOUT_SECS")
                .unwrap_or_else(|| UPLOAD_TIMEOUT_SECS.to_string())
                .parse()
                .unwrap_or(UPLOAD_TIMEOUT_SECS),
            upload_chunk_size: lookup("UPLOAD_CHUNK_SIZE")
                .unwrap_or_else(|| UPLOAD_CHUNK_SIZE.to_string())
                .parse()
                .unwrap_or(UPLOAD_CHUNK_SIZE),
            upload_max_concurrency: lookup("UPLOAD_MAX_CONCURRENCY")
                .unwrap_or_else(|| UPLOAD_MAX_CONCURRENCY.to_string())
                .parse()
                .unwrap_or(UPLOAD_MAX_CONCURRENCY),
            pipeline_buffer_chunks: lookup("PIPELINE_BUFFER_CHUNKS")
                .unwrap_or_else(|| PIPELINE_BUFFER_CHUNKS.to_string())
                .parse()
                .unwrap_or(PIPELINE_BUFFER_CHUNKS),
        };

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if !(0.0..=100.0).contains(&self.image_quality) {
            return Err(anyhow::anyhow!("IMAGE_QUALITY must be between 0 and 100"));
        }

        if self.image_max_dimension == 0 || self.video_max_width < 2 {
            return Err(anyhow::anyhow!(
                "IMAGE_MAX_DIMENSION and VIDEO_MAX_WIDTH must be positive"
            ));
        }

        if self.video_crf > 51 {
            return Err(anyhow::anyhow!("VIDEO_CRF must be between 0 and 51"));
        }

        if !X264_PRESETS.contains(&self.video_preset.as_str()) {
            return Err(anyhow::anyhow!(
                "VIDEO_PRESET must be one of: {}",
                X264_PRESETS.join(", ")
            ));
        }

        if self.upload_timeout_secs == 0 {
            return Err(anyhow::anyhow!("UPLOAD_TIMEOUT_SECS must be greater than 0"));
        }

        if self.upload_max_concurrency == 0 || self.pipeline_buffer_chunks == 0 {
            return Err(anyhow::anyhow!(
                "UPLOAD_MAX_CONCURRENCY and PIPELINE_BUFFER_CHUNKS must be greater than 0"
            ));
        }

        // Validate storage backend configuration
        let backend = self.storage_backend.unwrap_or(StorageBackend::S3);
        match backend {
            StorageBackend::S3 => {
                if self.s3_bucket.is_none() {
                    return Err(anyhow::anyhow!(
                        "S3_BUCKET must be set when using S3 storage backend"
                    ));
                }
                if self.s3_region.is_none() && self.aws_region.is_none() {
                    return Err(anyhow::anyhow!(
                        "S3_REGION or AWS_REGION must be set when using S3 storage backend"
                    ));
                }
                if self.upload_chunk_size < S3_MIN_PART_SIZE {
                    return Err(anyhow::anyhow!(
                        "UPLOAD_CHUNK_SIZE must be at least {} bytes for S3 multipart uploads",
                        S3_MIN_PART_SIZE
                    ));
                }
            }
            StorageBackend::Local => {
                if self.local_storage_path.is_none() {
                    return Err(anyhow::anyhow!(
                        "LOCAL_STORAGE_PATH must be set when using local storage backend"
                    ));
                }
                if self.local_storage_base_url.is_none() {
                    return Err(anyhow::anyhow!(
                        "LOCAL_STORAGE_BASE_URL must be set when using local storage backend"
                    ));
                }
                if self.upload_chunk_size == 0 {
                    return Err(anyhow::anyhow!("UPLOAD_CHUNK_SIZE must be greater than 0"));
                }
            }
        }

        Ok(())
    }
}
