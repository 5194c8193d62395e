//! Source-image resize modes.

use image::imageops::{self, FilterType};
use image::{ImageBuffer, Pixel};

/// How a source image is fitted to the processing resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResizeMode {
    /// Resample to the target, ignoring aspect ratio.
    #[default]
    Stretch,
    /// Scale to cover the target and center-crop the overflow.
    Crop,
    /// Scale to fit inside the target and extend the edges into the
    /// remaining bands.
    Fill,
}

impl ResizeMode {
    /// Numeric codes used by request payloads (3 selects latent-space
    /// resizing, which happens after encoding and not here).
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Stretch),
            1 => Some(Self::Crop),
            2 => Some(Self::Fill),
            _ => None,
        }
    }
}

/// Resizes `image` to `width` x `height` under the given mode.
pub fn resize_with_mode<P>(
    image: &ImageBuffer<P, Vec<u8>>,
    mode: ResizeMode,
    width: u32,
    height: u32,
) -> ImageBuffer<P, Vec<u8>>
where
    P: Pixel<Subpixel = u8> + 'static,
{
    let (src_w, src_h) = image.dimensions();
    if (src_w, src_h) == (width, height) {
        return image.clone();
    }
    if mode == ResizeMode::Stretch {
        return imageops::resize(image, width, height, FilterType::Lanczos3);
    }

    let ratio = width as f64 / height as f64;
    let src_ratio = src_w as f64 / src_h as f64;
    let (scaled_w, scaled_h) = match mode {
        // Crop covers the target; Fill fits inside it.
        ResizeMode::Crop => {
            if ratio > src_ratio {
                (width, (src_h as u64 * width as u64 / src_w as u64) as u32)
            } else {
                ((src_w as u64 * height as u64 / src_h as u64) as u32, height)
            }
        }
        ResizeMode::Fill => {
            if ratio < src_ratio {
                (width, (src_h as u64 * width as u64 / src_w as u64) as u32)
            } else {
                ((src_w as u64 * height as u64 / src_h as u64) as u32, height)
            }
        }
        ResizeMode::Stretch => unreachable!(),
    };

    let resized = imageops::resize(image, scaled_w.max(1), scaled_h.max(1), FilterType::Lanczos3);
    let mut canvas = ImageBuffer::new(width, height);
    let off_x = width as i64 / 2 - scaled_w as i64 / 2;
    let off_y = height as i64 / 2 - scaled_h as i64 / 2;
    imageops::replace(&mut canvas, &resized, off_x, off_y);

    if mode == ResizeMode::Fill {
        extend_edges(&mut canvas, off_x, off_y, scaled_w, scaled_h);
    }
    canvas
}

/// Replicates the outermost rows/columns of the pasted area into the empty
/// letterbox bands.
fn extend_edges<P>(
    canvas: &mut ImageBuffer<P, Vec<u8>>,
    off_x: i64,
    off_y: i64,
    scaled_w: u32,
    scaled_h: u32,
) where
    P: Pixel<Subpixel = u8> + 'static,
{
    let (width, height) = canvas.dimensions();
    if off_y > 0 {
        let top = off_y as u32;
        let bottom = (off_y as u32 + scaled_h - 1).min(height - 1);
        for x in 0..width {
            let top_pixel = *canvas.get_pixel(x, top);
            let bottom_pixel = *canvas.get_pixel(x, bottom);
            for y in 0..top {
                canvas.put_pixel(x, y, top_pixel);
            }
            for y in (off_y as u32 + scaled_h)..height {
                canvas.put_pixel(x, y, bottom_pixel);
            }
        }
    }
    if off_x > 0 {
        let left = off_x as u32;
        let right = (off_x as u32 + scaled_w - 1).min(width - 1);
        for y in 0..height {
            let left_pixel = *canvas.get_pixel(left, y);
            let right_pixel = *canvas.get_pixel(right, y);
            for x in 0..left {
                canvas.put_pixel(x, y, left_pixel);
            }
            for x in (off_x as u32 + scaled_w)..width {
                canvas.put_pixel(x, y, right_pixel);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn stretch_hits_exact_dimensions() {
        let src = RgbImage::from_pixel(10, 20, Rgb([50, 50, 50]));
        let out = resize_with_mode(&src, ResizeMode::Stretch, 16, 8);
        assert_eq!(out.dimensions(), (16, 8));
    }

    #[test]
    fn crop_covers_target_without_bands() {
        // Wide source into a square: height matches, width overflows and
        // is center-cropped, so no empty pixels remain.
        let src = RgbImage::from_pixel(40, 10, Rgb([200, 0, 0]));
        let out = resize_with_mode(&src, ResizeMode::Crop, 16, 16);
        assert_eq!(out.dimensions(), (16, 16));
        assert!(out.pixels().all(|p| p.0[0] > 0));
    }

    #[test]
    fn fill_extends_edges_into_bands() {
        // Wide source into a square leaves top/bottom bands that must be
        // filled from the nearest content row, not left black.
        let src = RgbImage::from_pixel(40, 10, Rgb([0, 180, 0]));
        let out = resize_with_mode(&src, ResizeMode::Fill, 16, 16);
        assert_eq!(out.dimensions(), (16, 16));
        assert_eq!(out.get_pixel(8, 0).0, [0, 180, 0]);
        assert_eq!(out.get_pixel(8, 15).0, [0, 180, 0]);
    }

    #[test]
    fn mode_codes_map_and_reject() {
        assert_eq!(ResizeMode::from_code(0), Some(ResizeMode::Stretch));
        assert_eq!(ResizeMode::from_code(1), Some(ResizeMode::Crop));
        assert_eq!(ResizeMode::from_code(2), Some(ResizeMode::Fill));
        assert_eq!(ResizeMode::from_code(3), None);
    }
}
