//! Conversions between 8-bit images and the float tensors the model
//! consumes, plus latent-space resampling helpers.

use burn::tensor::backend::Backend;
use burn::tensor::module::interpolate;
use burn::tensor::ops::{InterpolateMode, InterpolateOptions};
use burn::tensor::{Tensor, TensorData};
use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};

use burn_diffuse_rng::LATENT_FACTOR;

/// Packs images into an `[n, 3, h, w]` tensor scaled to `[-1, 1]`.
///
/// All images must share the dimensions of the first.
pub fn images_to_tensor<B: Backend>(images: &[RgbImage], device: &B::Device) -> Tensor<B, 4> {
    let (width, height) = images
        .first()
        .map(|image| image.dimensions())
        .unwrap_or((0, 0));
    let (width, height) = (width as usize, height as usize);

    let mut values = Vec::with_capacity(images.len() * 3 * height * width);
    for image in images {
        for channel in 0..3 {
            for y in 0..height {
                for x in 0..width {
                    let v = image.get_pixel(x as u32, y as u32).0[channel] as f32;
                    values.push(v / 255.0 * 2.0 - 1.0);
                }
            }
        }
    }

    let data = TensorData::new(values, [images.len(), 3, height, width]);
    Tensor::from_data(data, device)
}

/// Unpacks an `[n, 3, h, w]` tensor in `[-1, 1]` back into 8-bit images.
pub fn tensor_to_images<B: Backend>(tensor: Tensor<B, 4>) -> Vec<RgbImage> {
    let [n, _, height, width] = tensor.dims();
    let values = tensor
        .add_scalar(1.0)
        .div_scalar(2.0)
        .clamp(0.0, 1.0)
        .into_data()
        .to_vec::<f32>()
        .unwrap();

    let plane = height * width;
    (0..n)
        .map(|i| {
            let base = i * 3 * plane;
            RgbImage::from_fn(width as u32, height as u32, |x, y| {
                let offset = y as usize * width + x as usize;
                let sample = |channel: usize| {
                    (values[base + channel * plane + offset] * 255.0).round() as u8
                };
                image::Rgb([sample(0), sample(1), sample(2)])
            })
        })
        .collect()
}

/// Downsamples a grayscale mask to latent resolution and tiles it across
/// the latent channels, producing `[1, channels, latent_h, latent_w]` with
/// values in `[0, 1]`.
///
/// With `round` set, values snap to exactly 0 or 1 so every latent cell is
/// either fully kept or fully regenerated.
pub fn gray_to_latent_mask<B: Backend>(
    mask: &GrayImage,
    channels: usize,
    latent_height: usize,
    latent_width: usize,
    round: bool,
    device: &B::Device,
) -> Tensor<B, 4> {
    let resized = imageops::resize(
        mask,
        latent_width as u32,
        latent_height as u32,
        FilterType::CatmullRom,
    );

    let mut values = Vec::with_capacity(latent_height * latent_width);
    for pixel in resized.pixels() {
        let v = pixel.0[0] as f32 / 255.0;
        values.push(if round { v.round() } else { v });
    }

    let data = TensorData::new(values, [1, 1, latent_height, latent_width]);
    Tensor::<B, 4>::from_data(data, device).repeat_dim(1, channels)
}

/// Reports whether any element is NaN or infinite. Used to detect a failed
/// half-precision decode before handing images to the caller.
pub fn tensor_has_non_finite<B: Backend>(tensor: &Tensor<B, 4>) -> bool {
    tensor
        .clone()
        .into_data()
        .to_vec::<f32>()
        .unwrap()
        .iter()
        .any(|v| !v.is_finite())
}

/// Resamples a latent batch to a new spatial size.
pub fn resize_latent<B: Backend>(
    latent: Tensor<B, 4>,
    height: usize,
    width: usize,
    mode: InterpolateMode,
) -> Tensor<B, 4> {
    interpolate(latent, [height, width], InterpolateOptions::new(mode))
}

/// Converts pixel dimensions to latent dimensions.
pub fn latent_size(width: u32, height: u32) -> (usize, usize) {
    (
        width as usize / LATENT_FACTOR,
        height as usize / LATENT_FACTOR,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use image::Luma;

    type TestBackend = NdArray;

    #[test]
    fn image_round_trip_is_exact_on_flat_colors() {
        let image = RgbImage::from_pixel(16, 8, image::Rgb([255, 0, 128]));
        let device = Default::default();

        let tensor = images_to_tensor::<TestBackend>(&[image.clone()], &device);
        assert_eq!(tensor.dims(), [1, 3, 8, 16]);

        let back = tensor_to_images(tensor);
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].get_pixel(3, 3).0, [255, 0, 128]);
    }

    #[test]
    fn scaling_maps_extremes_to_unit_range() {
        let image = RgbImage::from_pixel(2, 2, image::Rgb([0, 255, 0]));
        let device = Default::default();

        let tensor = images_to_tensor::<TestBackend>(&[image], &device);
        let values = tensor.into_data().to_vec::<f32>().unwrap();
        assert_eq!(values[0], -1.0);
        assert_eq!(values[4], 1.0);
    }

    #[test]
    fn latent_mask_rounds_to_binary() {
        let mask = GrayImage::from_fn(16, 16, |x, _| {
            if x < 8 {
                Luma([255u8])
            } else {
                Luma([0u8])
            }
        });
        let device = Default::default();

        let latent = gray_to_latent_mask::<TestBackend>(&mask, 4, 2, 2, true, &device);
        assert_eq!(latent.dims(), [1, 4, 2, 2]);

        let values = latent.into_data().to_vec::<f32>().unwrap();
        for v in &values {
            assert!(*v == 0.0 || *v == 1.0);
        }
        // Left column masked, right column clear, identical on every channel.
        assert_eq!(values[0], 1.0);
        assert_eq!(values[1], 0.0);
        assert_eq!(values[4], 1.0);
        assert_eq!(values[5], 0.0);
    }

    #[test]
    fn non_finite_detection() {
        let device = Default::default();
        let clean = Tensor::<TestBackend, 4>::zeros([1, 4, 2, 2], &device);
        assert!(!tensor_has_non_finite(&clean));

        let poisoned = Tensor::<TestBackend, 4>::from_data(
            TensorData::new(vec![0.0f32, f32::NAN, 1.0, 2.0], [1, 1, 2, 2]),
            &device,
        );
        assert!(tensor_has_non_finite(&poisoned));
    }

    #[test]
    fn latent_resize_changes_spatial_dims_only() {
        let device = Default::default();
        let latent = Tensor::<TestBackend, 4>::ones([2, 4, 8, 8], &device);
        let resized = resize_latent(latent, 16, 16, InterpolateMode::Nearest);
        assert_eq!(resized.dims(), [2, 4, 16, 16]);
    }
}
