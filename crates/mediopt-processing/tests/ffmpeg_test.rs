//! Runs the real FFmpeg encoder over a generated clip. Skipped when `ffmpeg`
//! (with libx264) is not installed.

use std::io;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream;
use mediopt_core::{PipelineOutcome, UploadResult, VideoProfile};
use mediopt_processing::{
    ByteSource, PipelineController, PipelineRequest, PipelineSettings, VideoTransform,
};
use mediopt_storage::LocalStorage;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn ffmpeg_with_x264() -> bool {
    match Command::new("ffmpeg").args(["-hide_banner", "-encoders"]).output() {
        Ok(out) => out.status.success() && String::from_utf8_lossy(&out.stdout).contains("libx264"),
        Err(_) => false,
    }
}

/// Two seconds of 1080p test pattern with a tone. `clip.ts` demuxes from a
/// pipe; `clip.mp4` keeps the default layout with the moov atom at the end.
fn generate_clip(dir: &Path, name: &str) -> Vec<u8> {
    let path = dir.join(name);
    let (video_codec, audio_codec, format) = if name.ends_with(".mp4") {
        ("libx264", "aac", "mp4")
    } else {
        ("mpeg2video", "mp2", "mpegts")
    };
    let status = Command::new("ffmpeg")
        .args([
            "-hide_banner",
            "-loglevel",
            "error",
            "-f",
            "lavfi",
            "-i",
            "testsrc=duration=2:size=1920x1080:rate=25",
            "-f",
            "lavfi",
            "-i",
            "sine=frequency=440:duration=2",
            "-c:v",
            video_codec,
            "-c:a",
            audio_codec,
            "-f",
            format,
        ])
        .arg(&path)
        .status()
        .unwrap();
    assert!(status.success(), "clip generation failed");
    std::fs::read(&path).unwrap()
}

fn chunked(data: &[u8], size: usize) -> ByteSource {
    let chunks: Vec<Result<Bytes, io::Error>> = data
        .chunks(size)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    ByteSource::new(stream::iter(chunks), CancellationToken::new())
}

struct Harness {
    work: TempDir,
    media: TempDir,
    controller: PipelineController,
}

impl Harness {
    async fn new() -> Self {
        let work = tempfile::tempdir().unwrap();
        let media = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(media.path(), "http://localhost:4000/media".to_string())
            .await
            .unwrap()
            .with_upload_limits(64 * 1024, 2);
        let controller = PipelineController::new(
            Arc::new(storage),
            PipelineSettings {
                buffer_chunks: 4,
                egress_timeout: Duration::from_secs(60),
                scratch_root: work.path().to_path_buf(),
            },
        );
        Self {
            work,
            media,
            controller,
        }
    }

    async fn optimize(&self, transform: Arc<VideoTransform>, source: ByteSource) -> UploadResult {
        let (outcome, _) = self
            .controller
            .start(PipelineRequest {
                request_id: Uuid::new_v4(),
                source,
                transform,
                folder: "videos".to_string(),
            })
            .finish()
            .await;
        match outcome {
            PipelineOutcome::Success(result) => result,
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    fn stored(&self, result: &UploadResult) -> Vec<u8> {
        std::fs::read(self.media.path().join(format!("{}.mp4", result.public_id))).unwrap()
    }
}

fn assert_downscaled(result: &UploadResult) {
    assert_eq!(result.format, "mp4");
    assert!(result.width.is_some_and(|w| w <= 1280), "width {:?}", result.width);
    assert!(result.duration.is_some());
    assert!(result.bytes > 0);
}

#[tokio::test]
async fn test_ffmpeg_downscales_and_is_chunking_independent() {
    if !ffmpeg_with_x264() {
        eprintln!("ffmpeg with libx264 not available, skipping");
        return;
    }

    let harness = Harness::new().await;
    let clip = generate_clip(harness.work.path(), "clip.ts");
    let transform = Arc::new(VideoTransform::new(VideoProfile::default(), "ffmpeg", false).unwrap());

    let mut stored = Vec::new();
    for size in [7_919, 64 * 1024] {
        let result = harness.optimize(transform.clone(), chunked(&clip, size)).await;
        assert_downscaled(&result);

        let bytes = harness.stored(&result);
        assert_eq!(bytes.len() as u64, result.bytes);
        stored.push(bytes);
    }

    assert_eq!(stored[0], stored[1]);
}

#[tokio::test]
async fn test_spooled_input_reads_trailing_moov_mp4() {
    if !ffmpeg_with_x264() {
        eprintln!("ffmpeg with libx264 not available, skipping");
        return;
    }

    let harness = Harness::new().await;
    let clip = generate_clip(harness.work.path(), "clip.mp4");
    let transform = Arc::new(VideoTransform::new(VideoProfile::default(), "ffmpeg", true).unwrap());

    let result = harness.optimize(transform, chunked(&clip, 32 * 1024)).await;

    assert_downscaled(&result);
    assert_eq!(harness.stored(&result).len() as u64, result.bytes);
}
