//! Crop-region geometry for full-resolution inpainting.

use image::GrayImage;

/// Pixel rectangle with exclusive lower-right corner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRegion {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl CropRegion {
    pub fn width(&self) -> u32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> u32 {
        self.y2 - self.y1
    }
}

/// Bounding box of all nonzero mask pixels, grown by `pad` and clamped to
/// the image. An empty mask yields the whole image.
pub fn get_crop_region(mask: &GrayImage, pad: u32) -> CropRegion {
    let (width, height) = mask.dimensions();
    let mut bounds: Option<(u32, u32, u32, u32)> = None;
    for (x, y, pixel) in mask.enumerate_pixels() {
        if pixel.0[0] == 0 {
            continue;
        }
        bounds = Some(match bounds {
            None => (x, y, x, y),
            Some((min_x, min_y, max_x, max_y)) => {
                (min_x.min(x), min_y.min(y), max_x.max(x), max_y.max(y))
            }
        });
    }
    match bounds {
        Some((min_x, min_y, max_x, max_y)) => CropRegion {
            x1: min_x.saturating_sub(pad),
            y1: min_y.saturating_sub(pad),
            x2: (max_x + 1 + pad).min(width),
            y2: (max_y + 1 + pad).min(height),
        },
        None => CropRegion {
            x1: 0,
            y1: 0,
            x2: width,
            y2: height,
        },
    }
}

/// Grows `region` along one axis until its aspect ratio matches the
/// processing target, sliding back inside the image when the growth would
/// cross a border. The result never exceeds the image bounds.
pub fn expand_crop_region(
    region: CropRegion,
    target_w: u32,
    target_h: u32,
    image_w: u32,
    image_h: u32,
) -> CropRegion {
    if region.width() == 0 || region.height() == 0 {
        return CropRegion {
            x1: 0,
            y1: 0,
            x2: image_w,
            y2: image_h,
        };
    }

    let mut x1 = region.x1 as i64;
    let mut y1 = region.y1 as i64;
    let mut x2 = region.x2 as i64;
    let mut y2 = region.y2 as i64;
    let ratio_region = region.width() as f64 / region.height() as f64;
    let ratio_target = target_w as f64 / target_h as f64;

    if ratio_region > ratio_target {
        let desired_height = (x2 - x1) as f64 / ratio_target;
        let diff = (desired_height - (y2 - y1) as f64) as i64;
        y1 -= diff / 2;
        y2 += diff - diff / 2;
        if y2 >= image_h as i64 {
            let over = y2 - image_h as i64;
            y2 -= over;
            y1 -= over;
        }
        if y1 < 0 {
            y2 -= y1;
            y1 = 0;
        }
        if y2 > image_h as i64 {
            y2 = image_h as i64;
        }
    } else {
        let desired_width = (y2 - y1) as f64 * ratio_target;
        let diff = (desired_width - (x2 - x1) as f64) as i64;
        x1 -= diff / 2;
        x2 += diff - diff / 2;
        if x2 >= image_w as i64 {
            let over = x2 - image_w as i64;
            x2 -= over;
            x1 -= over;
        }
        if x1 < 0 {
            x2 -= x1;
            x1 = 0;
        }
        if x2 > image_w as i64 {
            x2 = image_w as i64;
        }
    }

    CropRegion {
        x1: x1.max(0) as u32,
        y1: y1.max(0) as u32,
        x2: x2.max(0) as u32,
        y2: y2.max(0) as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn mask_with_block(w: u32, h: u32, x1: u32, y1: u32, x2: u32, y2: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| {
            if x >= x1 && x < x2 && y >= y1 && y < y2 {
                Luma([255])
            } else {
                Luma([0])
            }
        })
    }

    #[test]
    fn bounding_box_covers_painted_pixels() {
        let mask = mask_with_block(64, 64, 10, 20, 30, 25);
        let region = get_crop_region(&mask, 0);
        assert_eq!(region, CropRegion { x1: 10, y1: 20, x2: 30, y2: 25 });
    }

    #[test]
    fn padding_grows_and_clamps() {
        let mask = mask_with_block(64, 64, 2, 2, 62, 62);
        let region = get_crop_region(&mask, 8);
        assert_eq!(region, CropRegion { x1: 0, y1: 0, x2: 64, y2: 64 });
    }

    #[test]
    fn empty_mask_returns_full_image() {
        let mask = GrayImage::new(32, 16);
        let region = get_crop_region(&mask, 4);
        assert_eq!(region, CropRegion { x1: 0, y1: 0, x2: 32, y2: 16 });
    }

    #[test]
    fn expansion_matches_target_aspect() {
        // A 128x32 strip processed at 512x512 should expand to 128x128.
        let region = CropRegion { x1: 100, y1: 200, x2: 228, y2: 232 };
        let expanded = expand_crop_region(region, 512, 512, 512, 512);
        assert_eq!(expanded.width(), 128);
        assert_eq!(expanded.height(), 128);
    }

    #[test]
    fn expansion_stays_inside_image() {
        // Region hugging the bottom border must slide up, not overflow.
        let region = CropRegion { x1: 0, y1: 500, x2: 128, y2: 512 };
        let expanded = expand_crop_region(region, 512, 512, 512, 512);
        assert!(expanded.y2 <= 512);
        assert_eq!(expanded.width(), 128);
        assert_eq!(expanded.height(), 128);
        assert_eq!(expanded.y2, 512);
        assert_eq!(expanded.y1, 384);
    }

    #[test]
    fn aspect_is_within_one_pixel_for_odd_sizes() {
        let region = CropRegion { x1: 10, y1: 10, x2: 41, y2: 20 };
        let expanded = expand_crop_region(region, 512, 512, 256, 256);
        let diff = (expanded.width() as i64 - expanded.height() as i64).abs();
        assert!(diff <= 1, "width {} height {}", expanded.width(), expanded.height());
    }
}
