//! Image-to-image setup and sampling.
//!
//! Setup turns the caller's source images and mask into everything the
//! sampling loop needs: the encoded init latent, the latent-space blend
//! masks, overlay images for pasting unmasked content back, and the
//! image conditioning. It runs once per request, before the batch loop.

use burn::tensor::backend::Backend;
use burn::tensor::ops::InterpolateMode;
use burn::tensor::Tensor;
use image::imageops;
use image::{Rgb, RgbImage};

use burn_diffuse_imageops::{
    boost_contrast, create_binary_mask, expand_crop_region, fill_masked, flatten,
    gaussian_blur_x, gaussian_blur_y, get_crop_region, invert_mask, make_overlay,
    resize_with_mode, CropRegion, ResizeMode,
};
use burn_diffuse_rng::ImageRng;

use crate::backend::{Conditioning, DiffusionBackend, SampleParams};
use crate::error::ProcessError;
use crate::image_conditioning::{img2img_conditioning, ConditioningScheme};
use crate::infotext::format_number;
use crate::latent::{gray_to_latent_mask, images_to_tensor, latent_size, resize_latent};
use crate::options::Options;
use crate::request::{GenerationRequest, Image2ImageParams, InpaintFill, RequestKind};

/// Latent-space resize request; the pixel-space modes are 0..=2.
pub const RESIZE_MODE_LATENT: u8 = 3;

/// Prepares source images, masks and the init latent.
pub fn init_img2img<B: Backend, M: DiffusionBackend<B> + ?Sized>(
    model: &M,
    options: &Options,
    p: &mut GenerationRequest<B>,
) -> Result<(), ProcessError> {
    let mut i2i = match &mut p.kind {
        RequestKind::Image2Image(i2i) => std::mem::take(i2i),
        RequestKind::Text2Image(_) => return Ok(()),
    };

    let result = setup(model, options, p, &mut i2i);
    p.kind = RequestKind::Image2Image(i2i);
    result
}

fn setup<B: Backend, M: DiffusionBackend<B> + ?Sized>(
    model: &M,
    options: &Options,
    p: &mut GenerationRequest<B>,
    i2i: &mut Image2ImageParams<B>,
) -> Result<(), ProcessError> {
    if i2i.init_images.is_empty() {
        return Err(ProcessError::MissingSourceImage);
    }

    let mut crop_region: Option<CropRegion> = None;

    let image_mask = match &i2i.image_mask {
        Some(raw) => {
            let mut mask = create_binary_mask(raw, i2i.mask_round);

            if i2i.inpainting_mask_invert {
                mask = invert_mask(&mask);
            }
            if i2i.mask_blur_x > 0.0 {
                mask = gaussian_blur_x(&mask, i2i.mask_blur_x);
            }
            if i2i.mask_blur_y > 0.0 {
                mask = gaussian_blur_y(&mask, i2i.mask_blur_y);
            }

            if i2i.inpaint_full_res {
                i2i.mask_for_overlay = Some(mask.clone());
                let region = get_crop_region(&mask, i2i.inpaint_full_res_padding);
                let region =
                    expand_crop_region(region, p.width, p.height, mask.width(), mask.height());
                let cropped = imageops::crop_imm(
                    &mask,
                    region.x1,
                    region.y1,
                    region.width(),
                    region.height(),
                )
                .to_image();
                mask = resize_with_mode(&cropped, ResizeMode::Fill, p.width, p.height);
                i2i.paste_to = Some((region.x1, region.y1, region.width(), region.height()));
                crop_region = Some(region);
            } else {
                let pixel_mode = ResizeMode::from_code(i2i.resize_mode).unwrap_or(ResizeMode::Fill);
                mask = resize_with_mode(&mask, pixel_mode, p.width, p.height);
                // At whole-image scale a soft mask reads too weak in the
                // overlay, so double its contrast there.
                i2i.mask_for_overlay = Some(boost_contrast(&mask));
            }

            Some(mask)
        }
        None => None,
    };

    // The latent compositing mask defaults to the processed inpaint mask
    // but can be overridden independently.
    let latent_mask_image = image_mask.as_ref().map(|mask| match &i2i.latent_mask {
        Some(override_mask) => {
            let gray = override_mask.to_luma8();
            if gray.dimensions() == mask.dimensions() {
                gray
            } else {
                resize_with_mode(&gray, ResizeMode::Stretch, mask.width(), mask.height())
            }
        }
        None => mask.clone(),
    });

    i2i.init_img_hash = i2i
        .init_images
        .first()
        .map(|image| content_digest(image.as_bytes()));

    let background = Rgb(options.img2img_background_color);
    let mut images: Vec<RgbImage> = Vec::with_capacity(i2i.init_images.len());
    for raw in &i2i.init_images {
        let mut image = flatten(raw, background);

        if crop_region.is_none() && i2i.resize_mode != RESIZE_MODE_LATENT {
            let mode = ResizeMode::from_code(i2i.resize_mode).unwrap_or(ResizeMode::Fill);
            image = resize_with_mode(&image, mode, p.width, p.height);
        }

        if let Some(mask_for_overlay) = &i2i.mask_for_overlay {
            i2i.overlay_images.push(make_overlay(&image, mask_for_overlay));
        }

        if let Some(region) = &crop_region {
            let cropped = imageops::crop_imm(
                &image,
                region.x1,
                region.y1,
                region.width(),
                region.height(),
            )
            .to_image();
            image = resize_with_mode(&cropped, ResizeMode::Fill, p.width, p.height);
        }

        // Every fill policy except keep-original floods the masked pixels
        // before encoding, so the removed content cannot leak into the
        // latent through partially-masked edge cells.
        if let Some(latent_mask_image) = &latent_mask_image {
            if i2i.inpainting_fill != InpaintFill::Original {
                image = fill_masked(&image, latent_mask_image);
            }
        }

        images.push(image);
    }

    if images.len() == 1 {
        images = vec![images.remove(0); p.batch_size];
        if !i2i.overlay_images.is_empty() {
            i2i.overlay_images = vec![i2i.overlay_images.remove(0); p.batch_size];
        }
    } else if images.len() <= p.batch_size {
        p.batch_size = images.len();
    } else {
        return Err(ProcessError::SourceImageCount {
            count: images.len(),
            batch_size: p.batch_size,
        });
    }

    let device = model.device();
    let source = images_to_tensor::<B>(&images, &device);
    let mut init_latent = model.encode_first_stage(source.clone());

    if i2i.resize_mode == RESIZE_MODE_LATENT {
        let (latent_width, latent_height) = latent_size(p.width, p.height);
        init_latent = resize_latent(
            init_latent,
            latent_height,
            latent_width,
            InterpolateMode::Bilinear,
        );
    }

    if let Some(latent_mask_image) = &latent_mask_image {
        let [batch, channels, latent_height, latent_width] = init_latent.dims();
        let regenerate = gray_to_latent_mask::<B>(
            latent_mask_image,
            channels,
            latent_height,
            latent_width,
            i2i.mask_round,
            &device,
        );
        let keep = regenerate.ones_like().sub(regenerate.clone());

        match i2i.inpainting_fill {
            InpaintFill::LatentNoise => {
                let seeds: Vec<i64> = p.all_seeds.iter().take(batch).copied().collect();
                let noise =
                    ImageRng::<B>::new([channels, latent_height, latent_width], &seeds, &device)
                        .next();
                init_latent = init_latent.mul(keep.clone()) + noise.mul(regenerate.clone());
            }
            InpaintFill::LatentNothing => {
                init_latent = init_latent.mul(keep.clone());
            }
            _ => {}
        }

        i2i.mask = Some(keep);
        i2i.nmask = Some(regenerate);
    }

    i2i.image_conditioning = Some(img2img_conditioning(
        model,
        &source,
        &init_latent,
        image_mask.as_ref(),
        i2i.mask_round,
        options.inpainting_mask_weight,
    ));
    i2i.init_latent = Some(init_latent);

    if matches!(
        model.conditioning_scheme(),
        ConditioningScheme::InpaintingHybrid
    ) {
        p.is_using_inpainting_conditioning = true;
    }

    Ok(())
}

/// Runs one image-to-image sampling pass and applies the latent blend.
pub fn sample_img2img_pass<B: Backend, M: DiffusionBackend<B> + ?Sized>(
    model: &mut M,
    options: &Options,
    p: &mut GenerationRequest<B>,
    params: &SampleParams,
    conditioning: &Conditioning<B>,
    seeds: &[i64],
    subseeds: &[i64],
) -> Result<Tensor<B, 4>, ProcessError> {
    let (init_latent, image_conditioning, mask, nmask, multiplier) = match &p.kind {
        RequestKind::Image2Image(i2i) => (
            i2i.init_latent
                .clone()
                .ok_or(ProcessError::MissingSourceImage)?,
            i2i.image_conditioning
                .clone()
                .ok_or(ProcessError::MissingSourceImage)?,
            i2i.mask.clone(),
            i2i.nmask.clone(),
            i2i.initial_noise_multiplier
                .unwrap_or(options.initial_noise_multiplier),
        ),
        RequestKind::Text2Image(_) => return Err(ProcessError::MissingSourceImage),
    };

    let [_, channels, latent_height, latent_width] = init_latent.dims();
    let mut rng = ImageRng::<B>::new(
        [channels, latent_height, latent_width],
        seeds,
        &model.device(),
    )
    .with_subseeds(subseeds, p.subseed_strength)
    .with_seed_resize(p.seed_resize_from_w, p.seed_resize_from_h);

    let mut noise = rng.next();
    if multiplier != 1.0 {
        p.set_extra_param("Noise multiplier", format_number(multiplier));
        noise = noise.mul_scalar(multiplier as f32);
    }

    let mut samples =
        model.sample_img2img(params, conditioning, init_latent.clone(), noise, &image_conditioning);

    // Stitch: regenerated content inside the mask, the untouched init
    // latent outside it.
    if let (Some(mask), Some(nmask)) = (mask, nmask) {
        samples = samples.mul(nmask) + init_latent.mul(mask);
    }

    Ok(samples)
}

/// Stable digest of raw image bytes, recorded in metadata so a source
/// image can be recognized later.
pub fn content_digest(bytes: &[u8]) -> String {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    format!("{hash:016x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable_and_content_sensitive() {
        let a = content_digest(&[1, 2, 3]);
        assert_eq!(a, content_digest(&[1, 2, 3]));
        assert_ne!(a, content_digest(&[1, 2, 4]));
        assert_eq!(a.len(), 16);
    }
}
