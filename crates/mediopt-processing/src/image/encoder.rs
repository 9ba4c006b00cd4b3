use bytes::Bytes;
use image::imageops::FilterType;
use image::metadata::Orientation;
use image::{DynamicImage, GenericImageView, ImageDecoder, ImageFormat, ImageReader};
use mediopt_core::ImageProfile;
use std::io::Cursor;

use crate::error::TransformError;

/// Result of one image optimization.
#[derive(Debug, Clone)]
pub struct OptimizedImage {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub source_format: Option<ImageFormat>,
}

/// Decode, orient, bound the longer edge and re-encode as WebP.
///
/// CPU bound; call from a blocking task.
pub fn optimize_image(data: &[u8], profile: &ImageProfile) -> Result<OptimizedImage, TransformError> {
    let reader = ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .map_err(|e| TransformError::Decode(e.to_string()))?;
    let source_format = reader.format();

    let mut decoder = reader
        .into_decoder()
        .map_err(|e| TransformError::Decode(e.to_string()))?;
    let orientation = decoder.orientation().unwrap_or(Orientation::NoTransforms);
    let mut img =
        DynamicImage::from_decoder(decoder).map_err(|e| TransformError::Decode(e.to_string()))?;

    if orientation != Orientation::NoTransforms {
        tracing::debug!(orientation = ?orientation, "Applying EXIF orientation");
        img.apply_orientation(orientation);
    }

    let img = downscale(img, profile.max_dimension);
    let (width, height) = img.dimensions();

    let rgba = img.to_rgba8();
    let encoded = webp::Encoder::from_rgba(&rgba, width, height).encode(profile.quality);
    if encoded.is_empty() {
        return Err(TransformError::Encode("WebP encoder produced no output".to_string()));
    }

    tracing::debug!(
        source_format = ?source_format,
        input_bytes = data.len(),
        output_bytes = encoded.len(),
        width,
        height,
        quality = profile.quality,
        "Image optimized"
    );

    Ok(OptimizedImage {
        data: Bytes::copy_from_slice(&encoded),
        width,
        height,
        source_format,
    })
}

/// Never upscales.
fn downscale(img: DynamicImage, max_dimension: u32) -> DynamicImage {
    let (width, height) = img.dimensions();
    if width.max(height) <= max_dimension {
        return img;
    }
    img.resize(max_dimension, max_dimension, FilterType::Lanczos3)
}
