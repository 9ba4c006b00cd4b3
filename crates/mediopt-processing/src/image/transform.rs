use async_trait::async_trait;
use bytes::BytesMut;
use mediopt_core::{ImageProfile, TransformProfile};

use super::encoder::optimize_image;
use crate::error::TransformError;
use crate::pipeline::{MediaTransform, TransformIo, TransformSummary};

/// Buffers the whole input (images decode from a complete byte buffer), then
/// encodes on the blocking pool.
pub struct ImageTransform {
    profile: TransformProfile,
    image: ImageProfile,
}

impl ImageTransform {
    pub fn new(image: ImageProfile) -> Self {
        Self {
            profile: TransformProfile::Image(image.clone()),
            image,
        }
    }
}

#[async_trait]
impl MediaTransform for ImageTransform {
    fn profile(&self) -> &TransformProfile {
        &self.profile
    }

    async fn run(&self, mut io: TransformIo) -> Result<TransformSummary, TransformError> {
        let limit = self.image.max_input_bytes;
        let mut buffer = BytesMut::new();
        while let Some(chunk) = io.next_input().await? {
            let size = buffer.len() + chunk.len();
            if size > limit {
                return Err(TransformError::InputTooLarge { size, limit });
            }
            buffer.extend_from_slice(&chunk);
        }
        if buffer.is_empty() {
            return Err(TransformError::Decode("empty input".to_string()));
        }

        let input = buffer.freeze();
        let profile = self.image.clone();
        let job = tokio::task::spawn_blocking(move || optimize_image(&input, &profile));

        let joined = tokio::select! {
            biased;
            _ = io.cancel.cancelled() => return Err(TransformError::Canceled),
            joined = job => joined,
        };
        let optimized = match joined {
            Ok(result) => result?,
            // Surface encoder panics to the stage supervisor.
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => return Err(TransformError::Encode(format!("encoder task failed: {}", e))),
        };

        io.monitor.progress(100);
        io.output.send(optimized.data).await?;

        Ok(TransformSummary {
            format: self.profile.output_format().to_string(),
            width: Some(optimized.width),
            height: Some(optimized.height),
            duration: None,
        })
    }
}
