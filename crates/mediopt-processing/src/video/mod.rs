//! Video optimization through an encoder subprocess.

pub mod ffmpeg;
mod transform;

pub use ffmpeg::{build_ffmpeg_args, FfmpegDiagnostics, FfmpegInput};
pub use transform::VideoTransform;
