//! Mask derivation and blurring.

use image::{DynamicImage, GrayImage, ImageBuffer, Luma, Pixel, Rgb, RgbImage};

/// Derives a grayscale mask from a user-painted image.
///
/// An RGBA image whose alpha channel actually varies is treated as an
/// alpha mask (thresholded at the midpoint when `round` is set); anything
/// else falls back to luminance.
pub fn create_binary_mask(image: &DynamicImage, round: bool) -> GrayImage {
    if image.color().has_alpha() {
        let rgba = image.to_rgba8();
        if rgba.pixels().any(|p| p.0[3] != 255) {
            return GrayImage::from_fn(rgba.width(), rgba.height(), |x, y| {
                let alpha = rgba.get_pixel(x, y).0[3];
                if round {
                    Luma([if alpha > 128 { 255 } else { 0 }])
                } else {
                    Luma([alpha])
                }
            });
        }
    }
    image.to_luma8()
}

/// Inverts a mask so painted and protected regions swap.
pub fn invert_mask(mask: &GrayImage) -> GrayImage {
    let mut out = mask.clone();
    for pixel in out.pixels_mut() {
        pixel.0[0] = 255 - pixel.0[0];
    }
    out
}

/// Doubles mask values and clamps, sharpening soft edges for overlay use.
pub fn boost_contrast(mask: &GrayImage) -> GrayImage {
    let mut out = mask.clone();
    for pixel in out.pixels_mut() {
        pixel.0[0] = pixel.0[0].saturating_mul(2);
    }
    out
}

/// Composites any alpha in `image` over a solid background color.
pub fn flatten(image: &DynamicImage, background: Rgb<u8>) -> RgbImage {
    if !image.color().has_alpha() {
        return image.to_rgb8();
    }
    let rgba = image.to_rgba8();
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let p = rgba.get_pixel(x, y).0;
        let a = p[3] as u32;
        let mut out = [0u8; 3];
        for c in 0..3 {
            out[c] = ((p[c] as u32 * a + background.0[c] as u32 * (255 - a)) / 255) as u8;
        }
        Rgb(out)
    })
}

/// Horizontal Gaussian blur with standard deviation `sigma`.
pub fn gaussian_blur_x<P>(image: &ImageBuffer<P, Vec<u8>>, sigma: f32) -> ImageBuffer<P, Vec<u8>>
where
    P: Pixel<Subpixel = u8> + 'static,
{
    blur_1d(image, sigma, true)
}

/// Vertical Gaussian blur with standard deviation `sigma`.
pub fn gaussian_blur_y<P>(image: &ImageBuffer<P, Vec<u8>>, sigma: f32) -> ImageBuffer<P, Vec<u8>>
where
    P: Pixel<Subpixel = u8> + 'static,
{
    blur_1d(image, sigma, false)
}

/// One-dimensional Gaussian pass. Kernel half-width is `int(2.5*sigma +
/// 0.5)`, capped so reflected indices stay inside the image; borders
/// reflect without repeating the edge sample.
fn blur_1d<P>(image: &ImageBuffer<P, Vec<u8>>, sigma: f32, horizontal: bool) -> ImageBuffer<P, Vec<u8>>
where
    P: Pixel<Subpixel = u8> + 'static,
{
    let (width, height) = image.dimensions();
    if sigma <= 0.0 || width == 0 || height == 0 {
        return image.clone();
    }
    let len = if horizontal { width } else { height } as usize;
    let kernel = gaussian_kernel(sigma, len.saturating_sub(1));
    let radius = (kernel.len() / 2) as isize;
    let channels = P::CHANNEL_COUNT as usize;

    ImageBuffer::from_fn(width, height, |x, y| {
        let mut acc = [0f32; 4];
        for (k, weight) in kernel.iter().enumerate() {
            let offset = k as isize - radius;
            let (sx, sy) = if horizontal {
                (reflect(x as isize + offset, width as usize) as u32, y)
            } else {
                (x, reflect(y as isize + offset, height as usize) as u32)
            };
            let samples = image.get_pixel(sx, sy).channels();
            for c in 0..channels {
                acc[c] += samples[c] as f32 * weight;
            }
        }
        let mut out = [0u8; 4];
        for c in 0..channels {
            out[c] = acc[c].round().clamp(0.0, 255.0) as u8;
        }
        *P::from_slice(&out[..channels])
    })
}

fn gaussian_kernel(sigma: f32, max_radius: usize) -> Vec<f32> {
    let radius = ((2.5 * sigma + 0.5) as usize).min(max_radius);
    let denom = 2.0 * sigma * sigma;
    let mut kernel: Vec<f32> = (-(radius as isize)..=radius as isize)
        .map(|i| (-((i * i) as f32) / denom).exp())
        .collect();
    let sum: f32 = kernel.iter().sum();
    for w in &mut kernel {
        *w /= sum;
    }
    kernel
}

/// Reflect-without-edge-repeat border indexing.
fn reflect(index: isize, len: usize) -> usize {
    let len = len as isize;
    let mut i = index;
    if i < 0 {
        i = -i;
    }
    if i >= len {
        i = 2 * len - 2 - i;
    }
    i.clamp(0, len - 1) as usize
}
