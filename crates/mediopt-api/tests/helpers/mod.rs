//! Shared setup for API tests: local storage in a temp directory behind the
//! real router.

#![allow(dead_code)]

use axum_test::TestServer;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use mediopt_api::setup::routes::setup_routes;
use mediopt_api::AppState;
use mediopt_core::{Config, OptimizerConfig, VideoProfile};
use mediopt_processing::{MediaTransform, VideoTransform};
use mediopt_storage::{LocalStorage, Storage};
use std::collections::HashMap;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

pub const BASE_URL: &str = "http://localhost:3000/media";

pub struct TestApp {
    pub server: TestServer,
    pub media_root: PathBuf,
    _media: TempDir,
    _scratch: TempDir,
}

impl TestApp {
    /// Router backed by local storage, with `cat` standing in for ffmpeg.
    pub async fn new() -> Self {
        let media = tempfile::tempdir().expect("Failed to create media directory");
        let storage = LocalStorage::new(media.path(), BASE_URL.to_string())
            .await
            .expect("Failed to create local storage");
        Self::build(media, Arc::new(storage), Some(stand_in_encoder("cat", &[])))
    }

    /// Router backed by the given storage.
    pub async fn with_storage(storage: Arc<dyn Storage>) -> Self {
        let media = tempfile::tempdir().expect("Failed to create media directory");
        Self::build(media, storage, Some(stand_in_encoder("cat", &[])))
    }

    /// Router whose video encoder is the given program.
    pub async fn with_encoder(program: &str, args: &[&str]) -> Self {
        let media = tempfile::tempdir().expect("Failed to create media directory");
        let storage = LocalStorage::new(media.path(), BASE_URL.to_string())
            .await
            .expect("Failed to create local storage");
        Self::build(media, Arc::new(storage), Some(stand_in_encoder(program, args)))
    }

    fn build(
        media: TempDir,
        storage: Arc<dyn Storage>,
        encoder: Option<Arc<dyn MediaTransform>>,
    ) -> Self {
        let scratch = tempfile::tempdir().expect("Failed to create scratch directory");
        let config = test_config(&media, &scratch);

        let mut state = AppState::new(config.clone(), storage).expect("Failed to build state");
        if let Some(encoder) = encoder {
            state = state.with_video_transform(encoder);
        }
        let app = setup_routes(&config, Arc::new(state)).expect("Failed to build routes");
        let server = TestServer::new(app).expect("Failed to start test server");

        Self {
            server,
            media_root: media.path().to_path_buf(),
            _media: media,
            _scratch: scratch,
        }
    }

    /// Files stored under `folder`, relative to the media root.
    pub fn stored_files(&self, folder: &str) -> Vec<PathBuf> {
        match std::fs::read_dir(self.media_root.join(folder)) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

fn test_config(media: &TempDir, scratch: &TempDir) -> Config {
    let vars: HashMap<&str, String> = HashMap::from([
        ("STORAGE_BACKEND", "local".to_string()),
        ("LOCAL_STORAGE_PATH", media.path().to_string_lossy().to_string()),
        ("LOCAL_STORAGE_BASE_URL", BASE_URL.to_string()),
        ("TEMP_DIR", scratch.path().to_string_lossy().to_string()),
        ("IMAGE_FOLDER", "images".to_string()),
        ("VIDEO_FOLDER", "videos".to_string()),
    ]);
    let config = OptimizerConfig::from_lookup(|key| vars.get(key).cloned())
        .expect("Failed to build test config");
    Config(Box::new(config))
}

fn stand_in_encoder(program: &str, args: &[&str]) -> Arc<dyn MediaTransform> {
    Arc::new(VideoTransform::from_command(
        VideoProfile::default(),
        program,
        args.iter().map(|a| a.to_string()).collect(),
    ))
}

/// A noisy JPEG, so it does not compress down to nothing.
pub fn create_test_jpeg(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| {
        let n = x.wrapping_mul(2_654_435_761).wrapping_add(y.wrapping_mul(40_503));
        Rgb([(n >> 8) as u8, (x % 256) as u8, (y % 256) as u8])
    });
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut out, ImageFormat::Jpeg)
        .expect("Failed to encode test JPEG");
    out.into_inner()
}
