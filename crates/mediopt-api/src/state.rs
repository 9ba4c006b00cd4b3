//! Application state shared by all handlers.

use anyhow::{Context, Result};
use mediopt_core::{Config, MediaKind};
use mediopt_processing::{
    ImageTransform, MediaTransform, PipelineController, PipelineSettings, VideoTransform,
};
use mediopt_storage::Storage;
use std::sync::Arc;

/// Codec adapter plus destination folder for one media kind.
#[derive(Clone)]
pub struct MediaRoute {
    pub transform: Arc<dyn MediaTransform>,
    pub folder: String,
}

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub storage: Arc<dyn Storage>,
    pub pipeline: PipelineController,
    pub image: MediaRoute,
    pub video: MediaRoute,
}

impl AppState {
    pub fn new(config: Config, storage: Arc<dyn Storage>) -> Result<Self> {
        let settings = PipelineSettings {
            buffer_chunks: config.pipeline_buffer_chunks(),
            egress_timeout: config.upload_timeout(),
            scratch_root: config.temp_dir().clone(),
        };
        let video_transform = VideoTransform::new(
            config.video_profile(),
            config.ffmpeg_path(),
            config.video_spool_input(),
        )
        .context("Failed to configure video transform")?;

        Ok(Self {
            pipeline: PipelineController::new(storage.clone(), settings),
            image: MediaRoute {
                transform: Arc::new(ImageTransform::new(config.image_profile())),
                folder: config.image_folder().to_string(),
            },
            video: MediaRoute {
                transform: Arc::new(video_transform),
                folder: config.video_folder().to_string(),
            },
            config,
            storage,
        })
    }

    /// Replace the video encoder, e.g. with a stand-in program.
    pub fn with_video_transform(mut self, transform: Arc<dyn MediaTransform>) -> Self {
        self.video.transform = transform;
        self
    }

    pub fn route(&self, kind: MediaKind) -> &MediaRoute {
        match kind {
            MediaKind::Image => &self.image,
            MediaKind::Video => &self.video,
        }
    }
}
