//! Still image optimization: any decodable input to bounded WebP.

mod encoder;
mod transform;

pub use encoder::{optimize_image, OptimizedImage};
pub use transform::ImageTransform;
