//! Overlay construction, paste-back compositing, and masked-area fill.

use image::{GrayImage, Pixel, RgbImage, Rgba, RgbaImage};

use crate::mask::{gaussian_blur_x, gaussian_blur_y};
use crate::resize::{resize_with_mode, ResizeMode};

/// Builds the paste-back overlay: the original image with the mask
/// inverted into its alpha channel, so protected pixels stay opaque and
/// painted ones let the generated content through. Soft mask edges become
/// soft alpha edges.
pub fn make_overlay(image: &RgbImage, mask: &GrayImage) -> RgbaImage {
    RgbaImage::from_fn(image.width(), image.height(), |x, y| {
        let rgb = image.get_pixel(x, y).0;
        let alpha = 255 - mask.get_pixel(x, y).0[0];
        Rgba([rgb[0], rgb[1], rgb[2], alpha])
    })
}

/// Composites a generated image back into its source.
///
/// With a paste rectangle (full-resolution inpainting) the generated image
/// is fitted into that rectangle on a transparent canvas first; the
/// overlay from [`make_overlay`] then goes on top, restoring every
/// protected pixel.
pub fn apply_overlay(
    generated: &RgbImage,
    paste_to: Option<(u32, u32, u32, u32)>,
    overlay: &RgbaImage,
) -> RgbImage {
    let mut canvas = match paste_to {
        Some((x, y, w, h)) => {
            let fitted = resize_with_mode(generated, ResizeMode::Crop, w, h);
            let mut base = RgbaImage::new(overlay.width(), overlay.height());
            image::imageops::replace(
                &mut base,
                &opaque(&fitted),
                x as i64,
                y as i64,
            );
            base
        }
        None => opaque(generated),
    };

    for (base, top) in canvas.pixels_mut().zip(overlay.pixels()) {
        base.blend(top);
    }
    RgbImage::from_fn(canvas.width(), canvas.height(), |x, y| {
        let p = canvas.get_pixel(x, y).0;
        image::Rgb([p[0], p[1], p[2]])
    })
}

fn opaque(image: &RgbImage) -> RgbaImage {
    RgbaImage::from_fn(image.width(), image.height(), |x, y| {
        let rgb = image.get_pixel(x, y).0;
        Rgba([rgb[0], rgb[1], rgb[2], 255])
    })
}

/// Blur radii and pass counts for [`fill_masked`], largest first so far
/// pixels get some color before the sharper passes refine the boundary.
const FILL_PASSES: [(f32, usize); 6] = [
    (256.0, 1),
    (64.0, 1),
    (16.0, 2),
    (4.0, 4),
    (2.0, 2),
    (0.0, 1),
];

/// Replaces masked pixels with colors diffused from the surrounding
/// content. Works on an alpha-premultiplied copy whose masked pixels start
/// fully transparent; repeated blur-and-composite passes at shrinking radii
/// pull colors inward.
pub fn fill_masked(image: &RgbImage, mask: &GrayImage) -> RgbImage {
    let premultiplied = RgbaImage::from_fn(image.width(), image.height(), |x, y| {
        let rgb = image.get_pixel(x, y).0;
        let keep = 255 - mask.get_pixel(x, y).0[0] as u32;
        Rgba([
            (rgb[0] as u32 * keep / 255) as u8,
            (rgb[1] as u32 * keep / 255) as u8,
            (rgb[2] as u32 * keep / 255) as u8,
            keep as u8,
        ])
    });

    let mut canvas = RgbaImage::new(image.width(), image.height());
    for (sigma, repeats) in FILL_PASSES {
        let blurred = if sigma > 0.0 {
            gaussian_blur_y(&gaussian_blur_x(&premultiplied, sigma), sigma)
        } else {
            premultiplied.clone()
        };
        let straight = unpremultiply(&blurred);
        for _ in 0..repeats {
            for (base, top) in canvas.pixels_mut().zip(straight.pixels()) {
                base.blend(top);
            }
        }
    }

    RgbImage::from_fn(canvas.width(), canvas.height(), |x, y| {
        let p = canvas.get_pixel(x, y).0;
        image::Rgb([p[0], p[1], p[2]])
    })
}

fn unpremultiply(image: &RgbaImage) -> RgbaImage {
    RgbaImage::from_fn(image.width(), image.height(), |x, y| {
        let p = image.get_pixel(x, y).0;
        let a = p[3] as u32;
        if a == 0 {
            return Rgba([0, 0, 0, 0]);
        }
        Rgba([
            ((p[0] as u32 * 255 / a).min(255)) as u8,
            ((p[1] as u32 * 255 / a).min(255)) as u8,
            ((p[2] as u32 * 255 / a).min(255)) as u8,
            p[3],
        ])
    })
}
