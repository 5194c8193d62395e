//! The batch loop turning a request into finished images.
//!
//! [`GenerationRuntime`] owns the model and everything that outlives a
//! single run: options, the upscaler registry, registered hooks, the
//! conditioning caches and the shared job state.
//! [`process_images`](GenerationRuntime::process_images) is the one entry
//! point for both text-to-image and image-to-image requests.

use burn::tensor::backend::Backend;
use image::RgbImage;

use burn_diffuse_imageops::{apply_overlay, builtin_upscalers, ImageUpscaler};
use burn_diffuse_rng::{expand_seeds, expand_subseeds, resolve_seed, ImageRng, LATENT_FACTOR};

use crate::backend::{
    continuation_sampler, find_sampler, step_multiplier, Conditioning, DecodePrecision,
    DiffusionBackend, SampleParams,
};
use crate::conds::{get_or_compute, CondCaches, CondKey};
use crate::error::ProcessError;
use crate::hires::{calculate_hr_conds, hires_pass, setup_hires};
use crate::image_conditioning::{txt2img_conditioning, ConditioningScheme};
use crate::img2img::{init_img2img, sample_img2img_pass};
use crate::infotext::create_infotext;
use crate::latent::{latent_size, tensor_has_non_finite, tensor_to_images};
use crate::networks::{fingerprint, parse_prompts};
use crate::options::Options;
use crate::request::{GenerationRequest, RequestKind};
use crate::result::Processed;
use crate::scripts::{IterationState, ScriptRunner};
use crate::state::JobState;

/// A model plus the state shared between runs.
///
/// Keep one runtime alive for as long as the model is loaded; the
/// conditioning caches only pay off across consecutive
/// [`process_images`](Self::process_images) calls.
pub struct GenerationRuntime<B: Backend, M: DiffusionBackend<B>> {
    pub model: M,
    pub options: Options,
    /// Pixel-space upscalers selectable by name for the high-resolution
    /// pass.
    pub upscalers: Vec<Box<dyn ImageUpscaler>>,
    pub scripts: ScriptRunner<B>,
    pub caches: CondCaches<B>,
    /// Progress and control flags; clone it to interrupt or skip from
    /// another thread.
    pub state: JobState,
}

impl<B: Backend, M: DiffusionBackend<B>> GenerationRuntime<B, M> {
    pub fn new(model: M) -> Self {
        Self {
            model,
            options: Options::default(),
            upscalers: builtin_upscalers(),
            scripts: ScriptRunner::new(),
            caches: CondCaches::default(),
            state: JobState::new(),
        }
    }

    /// Runs a request to completion and assembles the result.
    ///
    /// Option overrides from the request are applied around the run and
    /// restored afterwards unless the request opts out. The request itself
    /// is left in its post-run state (resolved seeds, expanded prompts,
    /// adjusted dimensions) so callers can inspect what actually ran.
    pub fn process_images(
        &mut self,
        p: &mut GenerationRequest<B>,
    ) -> Result<Processed, ProcessError> {
        self.scripts.before_process(p);

        let prior = self.options.apply_overrides(&p.override_settings);
        let result = self.process_images_inner(p);
        if p.override_settings_restore_afterwards {
            self.options.restore(prior);
        }
        if !self.options.persistent_cond_cache {
            self.caches.clear();
        }
        result
    }

    fn process_images_inner(
        &mut self,
        p: &mut GenerationRequest<B>,
    ) -> Result<Processed, ProcessError> {
        if p.batch_size == 0 || p.n_iter == 0 {
            return Err(ProcessError::EmptyBatch);
        }
        if p.width == 0
            || p.height == 0
            || p.width as usize % LATENT_FACTOR != 0
            || p.height as usize % LATENT_FACTOR != 0
        {
            return Err(ProcessError::InvalidDimensions {
                width: p.width,
                height: p.height,
                factor: LATENT_FACTOR,
            });
        }
        let samplers = self.model.samplers();
        if find_sampler(&samplers, &p.sampler_name).is_none() {
            return Err(ProcessError::UnknownSampler(p.sampler_name.clone()));
        }

        if !p.seed_enable_extras {
            p.subseed = -1;
            p.subseed_strength = 0.0;
            p.seed_resize_from_w = 0;
            p.seed_resize_from_h = 0;
        }
        p.seed = resolve_seed(p.seed);
        p.subseed = resolve_seed(p.subseed);

        self.model.apply_circular(p.tiling);
        self.setup_prompts(p)?;

        let total = p.all_prompts.len();
        p.all_seeds = expand_seeds(p.seed, total, p.subseed_strength);
        p.all_subseeds = expand_subseeds(p.subseed, total);

        if !p.do_not_reload_embeddings {
            self.model.reload_embeddings();
        }
        self.scripts.process(p);

        self.state.begin(p.n_iter);
        match &p.kind {
            RequestKind::Text2Image(_) => {
                setup_hires(p, &self.options, &self.upscalers, &self.state)?;
            }
            RequestKind::Image2Image(_) => init_img2img(&self.model, &self.options, p)?,
        }
        self.model
            .apply_token_merging(p.token_merging_ratio(&self.options, false));

        let checkpoint = self.model.checkpoint();
        let device = self.model.device();
        let mut output_images: Vec<RgbImage> = Vec::new();
        let mut infotexts: Vec<String> = Vec::new();

        for n in 0..p.n_iter {
            p.iteration = n;
            // A skip requested after the previous batch finished must not
            // spill into this one.
            self.state.take_skip();
            if self.state.is_interrupted() {
                break;
            }

            let start = n * p.batch_size;
            let end = (start + p.batch_size).min(p.all_prompts.len());
            let mut batch = IterationState {
                iteration: n,
                prompts: p.all_prompts[start.min(end)..end].to_vec(),
                negative_prompts: p.all_negative_prompts[start.min(end)..end].to_vec(),
                seeds: p.all_seeds[start.min(end)..end].to_vec(),
                subseeds: p.all_subseeds[start.min(end)..end].to_vec(),
            };
            self.scripts.before_process_batch(p, &batch);
            if batch.prompts.is_empty() {
                break;
            }

            let (prompts, network_data) = parse_prompts(&batch.prompts);
            batch.prompts = prompts;
            p.extra_network_data = network_data;
            if let RequestKind::Text2Image(t2i) = &mut p.kind {
                if t2i.enable_hr {
                    let hr_end = end.min(t2i.all_hr_prompts.len());
                    let (hr_prompts, hr_data) =
                        parse_prompts(&t2i.all_hr_prompts[start.min(hr_end)..hr_end]);
                    t2i.hr_prompts = hr_prompts;
                    t2i.hr_extra_network_data = hr_data;
                    let hr_end = end.min(t2i.all_hr_negative_prompts.len());
                    t2i.hr_negative_prompts =
                        t2i.all_hr_negative_prompts[start.min(hr_end)..hr_end].to_vec();
                }
            }
            if !p.disable_extra_networks {
                self.model.activate_extra_networks(&p.extra_network_data);
            }
            self.scripts.process_batch(p, &batch);

            let cond_steps = p.steps * step_multiplier(&samplers, &p.sampler_name);
            let checkpoint_id = checkpoint.cache_identity();
            let networks = fingerprint(&p.extra_network_data);
            let clip_skip = self.options.clip_skip;
            let crop_left = self.options.sdxl_crop_left;
            let crop_top = self.options.sdxl_crop_top;
            let (width, height) = (p.width, p.height);
            let key = |prompts: &[String]| CondKey {
                prompts: prompts.to_vec(),
                steps: cond_steps,
                clip_skip,
                checkpoint: checkpoint_id.clone(),
                extra_networks: networks.clone(),
                crop_left,
                crop_top,
                width,
                height,
            };
            let uncond = get_or_compute(
                key(&batch.negative_prompts),
                &mut [&mut self.caches.uncond],
                || {
                    self.model
                        .learned_conditioning(&batch.negative_prompts, cond_steps, clip_skip)
                },
            );
            let cond = get_or_compute(key(&batch.prompts), &mut [&mut self.caches.cond], || {
                self.model
                    .learned_conditioning(&batch.prompts, cond_steps, clip_skip)
            });
            let conditioning = Conditioning { cond, uncond };

            // With a shared text encoder both passes can condition up
            // front, before the first pass commits the model to sampling.
            let hr_conditioning = if self.options.hires_fix_use_firstpass_conds {
                match &p.kind {
                    RequestKind::Text2Image(t2i) if t2i.enable_hr => {
                        let hr_prompts = t2i.hr_prompts.clone();
                        let hr_negatives = t2i.hr_negative_prompts.clone();
                        let hr_extra = t2i.hr_extra_network_data.clone();
                        let hr_steps = t2i.hr_second_pass_steps;
                        let hr_sampler = continuation_sampler(
                            &samplers,
                            t2i.hr_sampler_name.as_deref().unwrap_or(&p.sampler_name),
                        );
                        Some(calculate_hr_conds(
                            self,
                            p,
                            &hr_prompts,
                            &hr_negatives,
                            &hr_extra,
                            hr_steps,
                            &hr_sampler,
                        ))
                    }
                    _ => None,
                }
            } else {
                None
            };

            if p.n_iter > 1 {
                self.state.set_job(format!("Batch {} out of {}", n + 1, p.n_iter));
            }

            let params = SampleParams {
                sampler_name: p.sampler_name.clone(),
                steps: p.steps,
                cfg_scale: p.cfg_scale,
                image_cfg_scale: p.image_cfg_scale(),
                denoising_strength: p.denoising_strength,
                eta: p.eta,
                width: p.width,
                height: p.height,
            };
            let samples = match &p.kind {
                RequestKind::Text2Image(_) => {
                    let (latent_width, latent_height) = latent_size(p.width, p.height);
                    let mut rng = ImageRng::<B>::new(
                        [self.model.latent_channels(), latent_height, latent_width],
                        &batch.seeds,
                        &device,
                    )
                    .with_subseeds(&batch.subseeds, p.subseed_strength)
                    .with_seed_resize(p.seed_resize_from_w, p.seed_resize_from_h);
                    let noise = rng.next();

                    p.is_using_inpainting_conditioning = matches!(
                        self.model.conditioning_scheme(),
                        ConditioningScheme::InpaintingHybrid
                    );
                    let image_conditioning = txt2img_conditioning(&self.model, &noise);
                    let samples =
                        self.model
                            .sample(&params, &conditioning, noise, &image_conditioning);
                    hires_pass(self, p, &batch, samples, hr_conditioning)?
                }
                RequestKind::Image2Image(_) => sample_img2img_pass(
                    &mut self.model,
                    &self.options,
                    p,
                    &params,
                    &conditioning,
                    &batch.seeds,
                    &batch.subseeds,
                )?,
            };

            if self.state.take_skip() {
                self.state.next_job();
                continue;
            }

            log::debug!("decoding latents for batch {}", n + 1);
            let mut decoded = self
                .model
                .decode_first_stage(samples.clone(), DecodePrecision::Default);
            if tensor_has_non_finite(&decoded) {
                log::warn!("decoded batch contains non-finite values, retrying at full precision");
                decoded = self.model.decode_first_stage(samples, DecodePrecision::Full);
                if tensor_has_non_finite(&decoded) {
                    return Err(ProcessError::NonFiniteDecode);
                }
            }
            let mut batch_images = tensor_to_images(decoded);

            let expected = batch_images.len();
            self.scripts.postprocess_batch(p, &mut batch_images, n);
            if batch_images.len() != expected {
                return Err(ProcessError::HookCardinality {
                    expected,
                    actual: batch_images.len(),
                });
            }
            self.scripts.postprocess_batch_list(p, &mut batch_images, n);
            if batch_images.len() != expected {
                return Err(ProcessError::HookCardinality {
                    expected,
                    actual: batch_images.len(),
                });
            }

            for (i, mut image) in batch_images.into_iter().enumerate() {
                if let RequestKind::Image2Image(i2i) = &p.kind {
                    if let Some(overlay) = i2i.overlay_images.get(i) {
                        image = apply_overlay(&image, i2i.paste_to, overlay);
                    }
                }
                self.scripts.postprocess_image(p, &mut image, i);
                infotexts.push(create_infotext(p, &self.options, &checkpoint, n, i, false));
                output_images.push(image);
            }

            self.state.next_job();
        }

        if !p.disable_extra_networks && !p.extra_network_data.is_empty() {
            self.model.deactivate_extra_networks(&p.extra_network_data);
        }

        // An interrupted run still reports what it would have done.
        if infotexts.is_empty() {
            infotexts.push(create_infotext(p, &self.options, &checkpoint, 0, 0, true));
        }

        let mut res = Processed {
            images: output_images,
            infotexts,
            index_of_first_image: 0,
            prompt: p.main_prompt().to_string(),
            negative_prompt: p.all_negative_prompts.first().cloned().unwrap_or_default(),
            all_prompts: p.all_prompts.clone(),
            all_negative_prompts: p.all_negative_prompts.clone(),
            seed: p.all_seeds.first().copied().unwrap_or(-1),
            subseed: p.all_subseeds.first().copied().unwrap_or(-1),
            subseed_strength: p.subseed_strength,
            all_seeds: p.all_seeds.clone(),
            all_subseeds: p.all_subseeds.clone(),
            seed_resize_from_w: p.seed_resize_from_w,
            seed_resize_from_h: p.seed_resize_from_h,
            width: p.width,
            height: p.height,
            steps: p.steps,
            sampler_name: p.sampler_name.clone(),
            cfg_scale: p.cfg_scale,
            image_cfg_scale: p.image_cfg_scale(),
            batch_size: p.batch_size,
            denoising_strength: p.denoising_strength,
            clip_skip: self.options.clip_skip,
            model_name: checkpoint.name.clone(),
            model_hash: checkpoint.hash.clone(),
            styles: p.styles.clone(),
            extra_generation_params: p.extra_generation_params.clone(),
            is_using_inpainting_conditioning: p.is_using_inpainting_conditioning,
            comments: p.comments.join("\n"),
        };
        self.scripts.postprocess(p, &mut res);
        Ok(res)
    }

    /// Expands the request's prompts to one entry per image, with styles
    /// applied, and does the same for the high-resolution prompts (which
    /// fall back to the base ones when empty).
    fn setup_prompts(&self, p: &mut GenerationRequest<B>) -> Result<(), ProcessError> {
        let total = p.batch_size * p.n_iter;
        let prompts = p.prompt.expand(total)?;
        let negative_prompts = p.negative_prompt.expand(total)?;
        p.all_prompts = prompts
            .iter()
            .map(|prompt| self.options.apply_styles_to_prompt(prompt, &p.styles))
            .collect();
        p.all_negative_prompts = negative_prompts
            .iter()
            .map(|prompt| self.options.apply_styles_to_negative_prompt(prompt, &p.styles))
            .collect();

        if let RequestKind::Text2Image(t2i) = &mut p.kind {
            if t2i.enable_hr {
                let hr_prompts = if t2i.hr_prompt.is_empty() {
                    p.prompt.expand(total)?
                } else {
                    vec![t2i.hr_prompt.clone(); total]
                };
                let hr_negative_prompts = if t2i.hr_negative_prompt.is_empty() {
                    p.negative_prompt.expand(total)?
                } else {
                    vec![t2i.hr_negative_prompt.clone(); total]
                };
                t2i.all_hr_prompts = hr_prompts
                    .iter()
                    .map(|prompt| self.options.apply_styles_to_prompt(prompt, &p.styles))
                    .collect();
                t2i.all_hr_negative_prompts = hr_negative_prompts
                    .iter()
                    .map(|prompt| self.options.apply_styles_to_negative_prompt(prompt, &p.styles))
                    .collect();
            }
        }
        Ok(())
    }
}
