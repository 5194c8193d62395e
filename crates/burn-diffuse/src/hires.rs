//! The high-resolution second pass for text-to-image runs.
//!
//! The first pass samples at the requested size; this pass upscales the
//! result (in latent space or through a pixel-space upscaler), then runs
//! an image-to-image continuation over it. Setup resolves the target
//! resolution and validates the upscaler before any sampling happens.

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use image::RgbImage;

use burn_diffuse_imageops::ImageUpscaler;
use burn_diffuse_rng::{ImageRng, LATENT_FACTOR};

use crate::backend::{
    continuation_sampler, latent_upscale_mode, step_multiplier, Conditioning, DecodePrecision,
    DiffusionBackend, SampleParams,
};
use crate::conds::{get_or_compute, CondKey};
use crate::error::ProcessError;
use crate::image_conditioning::{img2img_conditioning, txt2img_conditioning};
use crate::infotext::format_number;
use crate::latent::{images_to_tensor, latent_size, resize_latent, tensor_to_images};
use crate::networks::{fingerprint, ExtraNetworkData};
use crate::options::Options;
use crate::process::GenerationRuntime;
use crate::request::{GenerationRequest, Prompts, RequestKind, Text2ImageParams};
use crate::scripts::IterationState;
use crate::state::JobState;

/// First-pass size used by the legacy sizing rule: scale the requested
/// dimensions to roughly this many pixels, rounded up to multiples of 64.
pub fn old_hires_fix_first_pass_dimensions(width: u32, height: u32) -> (u32, u32) {
    let desired_pixel_count = 512.0 * 512.0;
    let actual_pixel_count = (width as f64) * (height as f64);
    let scale = (desired_pixel_count / actual_pixel_count).sqrt();

    let width = ((scale * width as f64 / 64.0).ceil() * 64.0) as u32;
    let height = ((scale * height as f64 / 64.0).ceil() * 64.0) as u32;
    (width, height)
}

/// Resolves the second-pass target, records the metadata parameters, and
/// validates the upscaler. Disables the pass entirely when it would be a
/// no-op.
pub fn setup_hires<B: Backend>(
    p: &mut GenerationRequest<B>,
    options: &Options,
    upscalers: &[Box<dyn ImageUpscaler>],
    state: &JobState,
) -> Result<(), ProcessError> {
    let mut t2i = match &mut p.kind {
        RequestKind::Text2Image(t2i) => std::mem::take(t2i),
        RequestKind::Image2Image(_) => return Ok(()),
    };

    let result = setup(p, &mut t2i, options, upscalers, state);
    p.kind = RequestKind::Text2Image(t2i);
    result
}

fn setup<B: Backend>(
    p: &mut GenerationRequest<B>,
    t2i: &mut Text2ImageParams,
    options: &Options,
    upscalers: &[Box<dyn ImageUpscaler>],
    state: &JobState,
) -> Result<(), ProcessError> {
    if !t2i.enable_hr {
        return Ok(());
    }

    if let Some(hr_sampler) = &t2i.hr_sampler_name {
        if *hr_sampler != p.sampler_name {
            p.set_extra_param("Hires sampler", hr_sampler.clone());
        }
    }
    if !t2i.hr_prompt.is_empty() && Prompts::One(t2i.hr_prompt.clone()) != p.prompt {
        p.set_extra_param("Hires prompt", t2i.hr_prompt.clone());
    }
    if !t2i.hr_negative_prompt.is_empty()
        && Prompts::One(t2i.hr_negative_prompt.clone()) != p.negative_prompt
    {
        p.set_extra_param("Hires negative prompt", t2i.hr_negative_prompt.clone());
    }

    if options.use_old_hires_fix_width_height
        && t2i.applied_old_hires_behavior_to != Some((p.width, p.height))
    {
        t2i.hr_resize_x = p.width;
        t2i.hr_resize_y = p.height;
        t2i.hr_upscale_to_x = p.width;
        t2i.hr_upscale_to_y = p.height;

        let (width, height) = old_hires_fix_first_pass_dimensions(p.width, p.height);
        p.width = width;
        p.height = height;
        t2i.applied_old_hires_behavior_to = Some((width, height));
    }

    if t2i.hr_resize_x == 0 && t2i.hr_resize_y == 0 {
        p.set_extra_param("Hires upscale", format_number(t2i.hr_scale));
        t2i.hr_upscale_to_x = (p.width as f64 * t2i.hr_scale) as u32;
        t2i.hr_upscale_to_y = (p.height as f64 * t2i.hr_scale) as u32;
    } else {
        p.set_extra_param(
            "Hires resize",
            format!("{}x{}", t2i.hr_resize_x, t2i.hr_resize_y),
        );

        if t2i.hr_resize_y == 0 {
            t2i.hr_upscale_to_x = t2i.hr_resize_x;
            t2i.hr_upscale_to_y = t2i.hr_resize_x * p.height / p.width;
        } else if t2i.hr_resize_x == 0 {
            t2i.hr_upscale_to_x = t2i.hr_resize_y * p.width / p.height;
            t2i.hr_upscale_to_y = t2i.hr_resize_y;
        } else {
            // Cover the requested box while keeping the source aspect,
            // then note how much to crop off after upscaling.
            let src_ratio = p.width as f64 / p.height as f64;
            let dst_ratio = t2i.hr_resize_x as f64 / t2i.hr_resize_y as f64;

            if src_ratio < dst_ratio {
                t2i.hr_upscale_to_x = t2i.hr_resize_x;
                t2i.hr_upscale_to_y = t2i.hr_resize_x * p.height / p.width;
            } else {
                t2i.hr_upscale_to_x = t2i.hr_resize_y * p.width / p.height;
                t2i.hr_upscale_to_y = t2i.hr_resize_y;
            }

            t2i.truncate_x = (t2i.hr_upscale_to_x - t2i.hr_resize_x) / LATENT_FACTOR as u32;
            t2i.truncate_y = (t2i.hr_upscale_to_y - t2i.hr_resize_y) / LATENT_FACTOR as u32;
        }
    }

    // The user has chosen to do nothing.
    if t2i.hr_upscale_to_x == p.width && t2i.hr_upscale_to_y == p.height {
        t2i.enable_hr = false;
        p.denoising_strength = None;
        p.remove_extra_param("Hires upscale");
        p.remove_extra_param("Hires resize");
        return Ok(());
    }

    let mode_name = t2i
        .hr_upscaler
        .as_deref()
        .unwrap_or(&options.latent_upscale_default_mode);
    t2i.latent_scale_mode = latent_upscale_mode(mode_name);
    if t2i.latent_scale_mode.is_none()
        && !upscalers.iter().any(|upscaler| upscaler.name() == mode_name)
    {
        return Err(ProcessError::UnknownUpscaler(mode_name.to_string()));
    }

    state.refine_job_count(2);

    if t2i.hr_second_pass_steps > 0 {
        p.set_extra_param("Hires steps", t2i.hr_second_pass_steps.to_string());
    }
    if let Some(upscaler) = &t2i.hr_upscaler {
        p.set_extra_param("Hires upscaler", upscaler.clone());
    }

    Ok(())
}

/// Text conditioning for the second pass, looked up through the dedicated
/// hires cache slots with the first-pass slots as fallback.
pub(crate) fn calculate_hr_conds<B: Backend, M: DiffusionBackend<B>>(
    rt: &mut GenerationRuntime<B, M>,
    p: &GenerationRequest<B>,
    hr_prompts: &[String],
    hr_negative_prompts: &[String],
    hr_extra: &ExtraNetworkData,
    hr_steps: usize,
    hr_sampler: &str,
) -> Conditioning<B> {
    let samplers = rt.model.samplers();
    let steps = if hr_steps > 0 { hr_steps } else { p.steps };
    let steps = steps * step_multiplier(&samplers, hr_sampler);

    let checkpoint = rt.model.checkpoint().cache_identity();
    let networks = fingerprint(hr_extra);
    let clip_skip = rt.options.clip_skip;

    let key = |prompts: &[String]| CondKey {
        prompts: prompts.to_vec(),
        steps,
        clip_skip,
        checkpoint: checkpoint.clone(),
        extra_networks: networks.clone(),
        crop_left: rt.options.sdxl_crop_left,
        crop_top: rt.options.sdxl_crop_top,
        width: p.width,
        height: p.height,
    };

    let uncond = get_or_compute(
        key(hr_negative_prompts),
        &mut [&mut rt.caches.hr_uncond, &mut rt.caches.uncond],
        || rt.model.learned_conditioning(hr_negative_prompts, steps, clip_skip),
    );
    let cond = get_or_compute(
        key(hr_prompts),
        &mut [&mut rt.caches.hr_cond, &mut rt.caches.cond],
        || rt.model.learned_conditioning(hr_prompts, steps, clip_skip),
    );

    Conditioning { cond, uncond }
}

/// Upscales the first-pass latent and runs the continuation pass over it.
///
/// Returns the first-pass samples untouched when the pass is disabled or
/// the run was interrupted.
pub(crate) fn hires_pass<B: Backend, M: DiffusionBackend<B>>(
    rt: &mut GenerationRuntime<B, M>,
    p: &mut GenerationRequest<B>,
    batch: &IterationState,
    samples: Tensor<B, 4>,
    hr_conditioning: Option<Conditioning<B>>,
) -> Result<Tensor<B, 4>, ProcessError> {
    let (target_w, target_h, truncate_x, truncate_y) = match &p.kind {
        RequestKind::Text2Image(t2i) if t2i.enable_hr => (
            t2i.hr_upscale_to_x,
            t2i.hr_upscale_to_y,
            t2i.truncate_x as usize,
            t2i.truncate_y as usize,
        ),
        _ => return Ok(samples),
    };
    let (latent_mode, hr_sampler_name, hr_steps, hr_upscaler_name, hr_prompts, hr_negatives, hr_extra) =
        match &p.kind {
            RequestKind::Text2Image(t2i) => (
                t2i.latent_scale_mode.clone(),
                t2i.hr_sampler_name.clone(),
                t2i.hr_second_pass_steps,
                t2i.hr_upscaler.clone(),
                t2i.hr_prompts.clone(),
                t2i.hr_negative_prompts.clone(),
                t2i.hr_extra_network_data.clone(),
            ),
            RequestKind::Image2Image(_) => return Ok(samples),
        };

    if rt.state.is_interrupted() {
        return Ok(samples);
    }

    let device = rt.model.device();
    let (latent_target_w, latent_target_h) = latent_size(target_w, target_h);

    let samples = match latent_mode {
        Some(mode) => resize_latent(samples, latent_target_h, latent_target_w, mode),
        None => {
            let upscaler_name = hr_upscaler_name.unwrap_or_else(|| "None".to_string());
            let upscaler = rt
                .upscalers
                .iter()
                .find(|upscaler| upscaler.name() == upscaler_name)
                .ok_or_else(|| ProcessError::UnknownUpscaler(upscaler_name.clone()))?;

            let decoded = rt.model.decode_first_stage(samples, DecodePrecision::Default);
            let upscaled: Vec<RgbImage> = tensor_to_images(decoded)
                .iter()
                .map(|image| upscaler.upscale(image, target_w, target_h))
                .collect();
            rt.model
                .encode_first_stage(images_to_tensor::<B>(&upscaled, &device))
        }
    };

    // Crop the covering upscale down to the exact requested size.
    let [batch_len, channels, height, width] = samples.dims();
    let samples = samples.slice([
        0..batch_len,
        0..channels,
        truncate_y / 2..height - (truncate_y + 1) / 2,
        truncate_x / 2..width - (truncate_x + 1) / 2,
    ]);

    let image_conditioning = if rt.options.inpainting_mask_weight < 1.0 {
        let decoded = rt
            .model
            .decode_first_stage(samples.clone(), DecodePrecision::Default);
        img2img_conditioning(
            &rt.model,
            &decoded,
            &samples,
            None,
            true,
            rt.options.inpainting_mask_weight,
        )
    } else {
        txt2img_conditioning(&rt.model, &samples)
    };

    rt.state.next_job();

    let samplers = rt.model.samplers();
    let hr_sampler =
        continuation_sampler(&samplers, hr_sampler_name.as_deref().unwrap_or(&p.sampler_name));

    let [_, channels, latent_height, latent_width] = samples.dims();
    let mut rng = ImageRng::<B>::new([channels, latent_height, latent_width], &batch.seeds, &device)
        .with_subseeds(&batch.subseeds, p.subseed_strength)
        .with_seed_resize(p.seed_resize_from_w, p.seed_resize_from_h);
    let noise = rng.next();

    if !p.disable_extra_networks {
        rt.model.activate_extra_networks(&hr_extra);
    }

    let conditioning = match hr_conditioning {
        Some(conditioning) => conditioning,
        None => calculate_hr_conds(rt, p, &hr_prompts, &hr_negatives, &hr_extra, hr_steps, &hr_sampler),
    };

    rt.model
        .apply_token_merging(p.token_merging_ratio(&rt.options, true));
    rt.scripts.before_hr(p);

    let params = SampleParams {
        sampler_name: hr_sampler,
        steps: if hr_steps > 0 { hr_steps } else { p.steps },
        cfg_scale: p.cfg_scale,
        image_cfg_scale: p.image_cfg_scale(),
        denoising_strength: p.denoising_strength,
        eta: p.eta,
        width: (latent_width * LATENT_FACTOR) as u32,
        height: (latent_height * LATENT_FACTOR) as u32,
    };
    let samples = rt
        .model
        .sample_img2img(&params, &conditioning, samples, noise, &image_conditioning);

    rt.model
        .apply_token_merging(p.token_merging_ratio(&rt.options, false));

    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_diffuse_imageops::builtin_upscalers;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    fn hires_request(configure: impl FnOnce(&mut Text2ImageParams)) -> GenerationRequest<TestBackend> {
        let mut p = GenerationRequest::text2image();
        p.denoising_strength = Some(0.7);
        if let RequestKind::Text2Image(t2i) = &mut p.kind {
            t2i.enable_hr = true;
            configure(t2i);
        }
        p
    }

    fn run_setup(p: &mut GenerationRequest<TestBackend>) -> Result<(), ProcessError> {
        let options = Options::default();
        let upscalers = builtin_upscalers();
        let state = JobState::new();
        state.begin(1);
        setup_hires(p, &options, &upscalers, &state)
    }

    #[test]
    fn legacy_first_pass_sizing() {
        assert_eq!(old_hires_fix_first_pass_dimensions(1024, 1024), (512, 512));
        assert_eq!(old_hires_fix_first_pass_dimensions(768, 512), (640, 448));
    }

    #[test]
    fn scale_factor_sets_the_target_and_the_metadata() {
        let mut p = hires_request(|t2i| t2i.hr_scale = 2.0);
        run_setup(&mut p).unwrap();

        let RequestKind::Text2Image(t2i) = &p.kind else {
            unreachable!()
        };
        assert!(t2i.enable_hr);
        assert_eq!((t2i.hr_upscale_to_x, t2i.hr_upscale_to_y), (1024, 1024));
        assert!(p
            .extra_generation_params
            .contains(&("Hires upscale".to_string(), "2".to_string())));
    }

    #[test]
    fn one_sided_resize_keeps_the_aspect() {
        let mut p = hires_request(|t2i| t2i.hr_resize_x = 768);
        p.width = 512;
        p.height = 256;
        run_setup(&mut p).unwrap();

        let RequestKind::Text2Image(t2i) = &p.kind else {
            unreachable!()
        };
        assert_eq!((t2i.hr_upscale_to_x, t2i.hr_upscale_to_y), (768, 384));
        assert_eq!((t2i.truncate_x, t2i.truncate_y), (0, 0));
    }

    #[test]
    fn two_sided_resize_covers_and_truncates() {
        let mut p = hires_request(|t2i| {
            t2i.hr_resize_x = 768;
            t2i.hr_resize_y = 512;
        });
        run_setup(&mut p).unwrap();

        let RequestKind::Text2Image(t2i) = &p.kind else {
            unreachable!()
        };
        // Source is square, target is wider: scale to cover 768x512 by
        // upscaling to 768x768, then crop 256 pixels (32 latent rows).
        assert_eq!((t2i.hr_upscale_to_x, t2i.hr_upscale_to_y), (768, 768));
        assert_eq!((t2i.truncate_x, t2i.truncate_y), (0, 32));
        assert!(p
            .extra_generation_params
            .contains(&("Hires resize".to_string(), "768x512".to_string())));
    }

    #[test]
    fn same_size_target_disables_the_pass() {
        let mut p = hires_request(|t2i| t2i.hr_scale = 1.0);
        run_setup(&mut p).unwrap();

        let RequestKind::Text2Image(t2i) = &p.kind else {
            unreachable!()
        };
        assert!(!t2i.enable_hr);
        assert_eq!(p.denoising_strength, None);
        assert!(p.extra_generation_params.is_empty());
    }

    #[test]
    fn unknown_pixel_upscaler_is_rejected_up_front() {
        let mut p = hires_request(|t2i| t2i.hr_upscaler = Some("ESRGAN 9000".to_string()));
        assert!(matches!(
            run_setup(&mut p),
            Err(ProcessError::UnknownUpscaler(name)) if name == "ESRGAN 9000"
        ));
    }

    #[test]
    fn second_pass_doubles_the_job_count_once() {
        let options = Options::default();
        let upscalers = builtin_upscalers();
        let state = JobState::new();
        state.begin(3);

        let mut p = hires_request(|_| {});
        setup_hires(&mut p, &options, &upscalers, &state).unwrap();
        assert_eq!(state.job_count(), 6);

        // A second setup pass (another request reusing the state) must not
        // double again within the same run.
        let mut p = hires_request(|_| {});
        setup_hires(&mut p, &options, &upscalers, &state).unwrap();
        assert_eq!(state.job_count(), 6);
    }
}
