//! Shared domain models: media kinds, transform profiles, upload results and the
//! per-stage lifecycle states.

use std::fmt::{Display, Formatter, Result as FmtResult};

use serde::{Deserialize, Serialize};

use crate::error::{ErrorMetadata, PipelineError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
        }
    }
}

impl Display for MediaKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

/// Image target: longer edge bound and WebP quality (0-100).
#[derive(Debug, Clone, PartialEq)]
pub struct ImageProfile {
    pub max_dimension: u32,
    pub quality: f32,
    pub max_input_bytes: usize,
}

impl Default for ImageProfile {
    fn default() -> Self {
        Self {
            max_dimension: 1080,
            quality: 70.0,
            max_input_bytes: 25 * 1024 * 1024,
        }
    }
}

/// Video target: libx264 into fragmented MP4, width bounded, aspect preserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoProfile {
    pub max_width: u32,
    pub crf: u8,
    pub preset: String,
    pub codec: String,
    pub container: String,
}

impl Default for VideoProfile {
    fn default() -> Self {
        Self {
            max_width: 1280,
            crf: 28,
            preset: "veryfast".to_string(),
            codec: "libx264".to_string(),
            container: "mp4".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransformProfile {
    Image(ImageProfile),
    Video(VideoProfile),
}

impl TransformProfile {
    pub fn kind(&self) -> MediaKind {
        match self {
            TransformProfile::Image(_) => MediaKind::Image,
            TransformProfile::Video(_) => MediaKind::Video,
        }
    }

    /// Extension (and reported format) of the transformed output.
    pub fn output_format(&self) -> &str {
        match self {
            TransformProfile::Image(_) => "webp",
            TransformProfile::Video(v) => &v.container,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            TransformProfile::Image(_) => "image/webp",
            TransformProfile::Video(_) => "video/mp4",
        }
    }
}

/// Descriptive metadata returned to the caller on success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResult {
    pub url: String,
    pub public_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub playback_url: Option<String>,
    #[serde(rename = "type")]
    pub kind: MediaKind,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub format: String,
    pub bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

/// The single terminal result of one request.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    Success(UploadResult),
    Failure(PipelineError),
}

impl PipelineOutcome {
    pub fn http_status(&self) -> u16 {
        match self {
            PipelineOutcome::Success(_) => 200,
            PipelineOutcome::Failure(err) => err.http_status_code(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, PipelineOutcome::Success(_))
    }

    pub fn error(&self) -> Option<&PipelineError> {
        match self {
            PipelineOutcome::Success(_) => None,
            PipelineOutcome::Failure(err) => Some(err),
        }
    }
}

/// Lifecycle of one pipeline stage. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageState {
    Idle,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl StageState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageState::Completed | StageState::Failed | StageState::Canceled
        )
    }

    /// `Idle` may skip straight to a terminal state when teardown wins before the
    /// stage starts; `Running` is entered at most once.
    pub fn can_transition_to(&self, next: StageState) -> bool {
        match (self, next) {
            (StageState::Idle, StageState::Idle) => false,
            (StageState::Idle, _) => true,
            (StageState::Running, next) => next.is_terminal(),
            _ => false,
        }
    }
}

impl Display for StageState {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let s = match self {
            StageState::Idle => "idle",
            StageState::Running => "running",
            StageState::Completed => "completed",
            StageState::Failed => "failed",
            StageState::Canceled => "canceled",
        };
        f.write_str(s)
    }
}
