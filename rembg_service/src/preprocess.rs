use crate::{config::PreprocessSettings, session::TENSOR_EDGE};
use image::{DynamicImage, RgbImage};
use ndarray::Array3;

#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessConfig {
    pub target_size: usize,
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl From<&PreprocessSettings> for PreprocessConfig {
    fn from(settings: &PreprocessSettings) -> Self {
        Self {
            target_size: TENSOR_EDGE,
            mean: settings.mean,
            std: settings.std,
        }
    }
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self::from(&PreprocessSettings::default())
    }
}

/// Source coordinate sampled for `dst` when resizing `src_len` to `dst_len`.
pub fn nearest_source(dst: usize, src_len: usize, dst_len: usize) -> usize {
    dst * src_len / dst_len
}

#[derive(Debug, Clone, Default)]
pub struct Preprocessor {
    config: PreprocessConfig,
}

impl Preprocessor {
    pub fn new(config: PreprocessConfig) -> Self {
        Self { config }
    }

    /// Stretches the image onto the square model input and normalizes it into
    /// a channel-major tensor of `3 * size * size` values.
    pub fn transform(&self, image: &DynamicImage) -> Vec<f32> {
        let rgb = image.to_rgb8();
        let size = self.config.target_size;
        let (src_w, src_h) = (rgb.width() as usize, rgb.height() as usize);

        let tensor = Array3::from_shape_fn((3, size, size), |(c, y, x)| {
            let sx = nearest_source(x, src_w, size);
            let sy = nearest_source(y, src_h, size);
            let value = sample(&rgb, sx, sy, c);
            (value / 255.0 - self.config.mean[c]) / self.config.std[c]
        });

        let (data, _) = tensor.into_raw_vec_and_offset();
        data
    }
}

fn sample(rgb: &RgbImage, x: usize, y: usize, channel: usize) -> f32 {
    rgb.get_pixel(x as u32, y as u32).0[channel] as f32
}
