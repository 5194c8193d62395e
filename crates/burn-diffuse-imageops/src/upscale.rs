//! Upscaler abstraction for the high-resolution pass.

use image::imageops::{self, FilterType};
use image::RgbImage;

/// A named pixel-space upscaler. Implementations that wrap a model are
/// free to ignore the hint filters used by the built-ins.
pub trait ImageUpscaler {
    fn name(&self) -> &str;

    /// Scales `image` to exactly `width` x `height`.
    fn upscale(&self, image: &RgbImage, width: u32, height: u32) -> RgbImage;
}

/// Plain resampling, the default when no model upscaler is selected.
pub struct NoneUpscaler;

impl ImageUpscaler for NoneUpscaler {
    fn name(&self) -> &str {
        "None"
    }

    fn upscale(&self, image: &RgbImage, width: u32, height: u32) -> RgbImage {
        imageops::resize(image, width, height, FilterType::Lanczos3)
    }
}

pub struct LanczosUpscaler;

impl ImageUpscaler for LanczosUpscaler {
    fn name(&self) -> &str {
        "Lanczos"
    }

    fn upscale(&self, image: &RgbImage, width: u32, height: u32) -> RgbImage {
        imageops::resize(image, width, height, FilterType::Lanczos3)
    }
}

pub struct NearestUpscaler;

impl ImageUpscaler for NearestUpscaler {
    fn name(&self) -> &str {
        "Nearest"
    }

    fn upscale(&self, image: &RgbImage, width: u32, height: u32) -> RgbImage {
        imageops::resize(image, width, height, FilterType::Nearest)
    }
}

/// The upscalers available without any model weights.
pub fn builtin_upscalers() -> Vec<Box<dyn ImageUpscaler>> {
    vec![
        Box::new(NoneUpscaler),
        Box::new(LanczosUpscaler),
        Box::new(NearestUpscaler),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn builtins_carry_their_lookup_names() {
        let names: Vec<String> = builtin_upscalers()
            .iter()
            .map(|u| u.name().to_string())
            .collect();
        assert_eq!(names, vec!["None", "Lanczos", "Nearest"]);
    }

    #[test]
    fn nearest_preserves_flat_regions_exactly() {
        let src = RgbImage::from_pixel(4, 4, Rgb([7, 8, 9]));
        let out = NearestUpscaler.upscale(&src, 8, 8);
        assert_eq!(out.dimensions(), (8, 8));
        assert!(out.pixels().all(|p| p.0 == [7, 8, 9]));
    }
}
