use crate::{preprocess::nearest_source, session::TENSOR_EDGE};
use image::{
    codecs::png::{CompressionType, FilterType, PngEncoder},
    DynamicImage, ExtendedColorType, GenericImageView, GrayImage, ImageEncoder, Luma, Rgba,
    RgbaImage,
};
use thiserror::Error;

/// Ranges below this are treated as a uniform mask.
pub const DEGENERATE_RANGE: f32 = 1e-6;
/// Alpha written for every pixel of a uniform mask.
pub const MID_GRAY: u8 = 128;

#[derive(Error, Debug)]
pub enum PostprocessError {
    #[error("Mask has {actual} values, expected {expected}")]
    ShapeMismatch { expected: usize, actual: usize },
    #[error("Original image is {actual:?}, expected {expected:?}")]
    DimensionMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },
    #[error("Failed to encode PNG: {0}")]
    Encode(#[from] image::ImageError),
}

#[derive(Debug, Clone)]
pub struct Postprocessor {
    mask_size: u32,
}

impl Default for Postprocessor {
    fn default() -> Self {
        Self {
            mask_size: TENSOR_EDGE as u32,
        }
    }
}

impl Postprocessor {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn with_mask_size(mask_size: u32) -> Self {
        Self { mask_size }
    }

    /// Min-max scales the raw model output into an 8-bit mask.
    pub fn normalize_mask(&self, raw: &[f32]) -> Result<GrayImage, PostprocessError> {
        let size = self.mask_size;
        let expected = (size * size) as usize;
        if raw.len() != expected {
            return Err(PostprocessError::ShapeMismatch {
                expected,
                actual: raw.len(),
            });
        }

        let (min, max) = raw
            .iter()
            .fold((f32::MAX, f32::MIN), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
        let range = max - min;

        if range.is_nan() || range < DEGENERATE_RANGE {
            tracing::warn!(min, max, "Uniform mask, falling back to mid-gray alpha");
            return Ok(GrayImage::from_pixel(size, size, Luma([MID_GRAY])));
        }

        Ok(GrayImage::from_fn(size, size, |x, y| {
            let value = raw[(y * size + x) as usize];
            Luma([((value - min) / range * 255.0) as u8])
        }))
    }

    /// Applies the model output as alpha over `original` and encodes a PNG.
    pub fn transform(
        &self,
        raw: &[f32],
        original: &DynamicImage,
        width: u32,
        height: u32,
    ) -> Result<Vec<u8>, PostprocessError> {
        if original.dimensions() != (width, height) {
            return Err(PostprocessError::DimensionMismatch {
                expected: (width, height),
                actual: original.dimensions(),
            });
        }

        let mask = self.normalize_mask(raw)?;
        let alpha = resize_mask(&mask, width, height);
        let rgb = original.to_rgb8();

        let composited = RgbaImage::from_fn(width, height, |x, y| {
            let [r, g, b] = rgb.get_pixel(x, y).0;
            Rgba([r, g, b, alpha.get_pixel(x, y).0[0]])
        });

        let mut encoded = Vec::new();
        PngEncoder::new_with_quality(&mut encoded, CompressionType::Best, FilterType::Adaptive)
            .write_image(composited.as_raw(), width, height, ExtendedColorType::Rgba8)?;

        Ok(encoded)
    }
}

pub fn resize_mask(mask: &GrayImage, width: u32, height: u32) -> GrayImage {
    let (src_w, src_h) = (mask.width() as usize, mask.height() as usize);
    GrayImage::from_fn(width, height, |x, y| {
        let sx = nearest_source(x as usize, src_w, width as usize);
        let sy = nearest_source(y as usize, src_h, height as usize);
        *mask.get_pixel(sx as u32, sy as u32)
    })
}
