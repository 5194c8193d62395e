//! Everything the caller specifies about a generation run, plus the
//! per-run bookkeeping the pipeline fills in (resolved seeds, expanded
//! prompts, encoded init latents).

use std::collections::BTreeMap;

use burn::tensor::backend::Backend;
use burn::tensor::ops::InterpolateMode;
use burn::tensor::Tensor;
use image::{DynamicImage, GrayImage, RgbaImage};

use crate::error::ProcessError;
use crate::image_conditioning::ImageConditioning;
use crate::networks::ExtraNetworkData;
use crate::options::Options;

/// One prompt for every image, or one prompt per image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prompts {
    One(String),
    PerImage(Vec<String>),
}

impl Default for Prompts {
    fn default() -> Self {
        Prompts::One(String::new())
    }
}

impl From<&str> for Prompts {
    fn from(prompt: &str) -> Self {
        Prompts::One(prompt.to_string())
    }
}

impl From<String> for Prompts {
    fn from(prompt: String) -> Self {
        Prompts::One(prompt)
    }
}

impl From<Vec<String>> for Prompts {
    fn from(prompts: Vec<String>) -> Self {
        Prompts::PerImage(prompts)
    }
}

impl Prompts {
    /// Expands to exactly `total` entries. A per-image list must already
    /// have that length.
    pub fn expand(&self, total: usize) -> Result<Vec<String>, ProcessError> {
        match self {
            Prompts::One(prompt) => Ok(vec![prompt.clone(); total]),
            Prompts::PerImage(prompts) if prompts.is_empty() => Err(ProcessError::EmptyPrompt),
            Prompts::PerImage(prompts) if prompts.len() != total => {
                Err(ProcessError::PromptCount {
                    expected: total,
                    found: prompts.len(),
                })
            }
            Prompts::PerImage(prompts) => Ok(prompts.clone()),
        }
    }
}

/// What goes into the masked region before sampling starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InpaintFill {
    /// Keep the original content as the starting point.
    #[default]
    Original,
    /// Flood the masked pixels with surrounding colors before encoding.
    Fill,
    /// Replace the masked latent region with seeded noise.
    LatentNoise,
    /// Zero the masked latent region.
    LatentNothing,
}

/// High-resolution second pass configuration (text-to-image only).
#[derive(Debug, Clone)]
pub struct Text2ImageParams {
    pub enable_hr: bool,
    /// Uniform scale factor, used when no explicit resize is given.
    pub hr_scale: f64,
    /// Upscaler name; either a latent mode or a pixel-space upscaler.
    pub hr_upscaler: Option<String>,
    /// Steps for the second pass; 0 reuses the first-pass count.
    pub hr_second_pass_steps: usize,
    pub hr_resize_x: u32,
    pub hr_resize_y: u32,
    /// Sampler override for the second pass.
    pub hr_sampler_name: Option<String>,
    /// Prompt override for the second pass; empty reuses the first-pass
    /// prompt.
    pub hr_prompt: String,
    pub hr_negative_prompt: String,

    // Derived during setup.
    pub hr_upscale_to_x: u32,
    pub hr_upscale_to_y: u32,
    pub truncate_x: u32,
    pub truncate_y: u32,
    /// Set when legacy first-pass sizing rewrote `width`/`height`.
    pub applied_old_hires_behavior_to: Option<(u32, u32)>,
    pub all_hr_prompts: Vec<String>,
    pub all_hr_negative_prompts: Vec<String>,
    /// Current batch's hires prompts with extra-network tags stripped.
    pub hr_prompts: Vec<String>,
    pub hr_negative_prompts: Vec<String>,
    pub hr_extra_network_data: ExtraNetworkData,
    pub latent_scale_mode: Option<InterpolateMode>,
}

impl Default for Text2ImageParams {
    fn default() -> Self {
        Self {
            enable_hr: false,
            hr_scale: 2.0,
            hr_upscaler: None,
            hr_second_pass_steps: 0,
            hr_resize_x: 0,
            hr_resize_y: 0,
            hr_sampler_name: None,
            hr_prompt: String::new(),
            hr_negative_prompt: String::new(),
            hr_upscale_to_x: 0,
            hr_upscale_to_y: 0,
            truncate_x: 0,
            truncate_y: 0,
            applied_old_hires_behavior_to: None,
            all_hr_prompts: Vec::new(),
            all_hr_negative_prompts: Vec::new(),
            hr_prompts: Vec::new(),
            hr_negative_prompts: Vec::new(),
            hr_extra_network_data: ExtraNetworkData::new(),
            latent_scale_mode: None,
        }
    }
}

/// Image-to-image configuration, including the mask pipeline.
#[derive(Debug, Clone)]
pub struct Image2ImageParams<B: Backend> {
    pub init_images: Vec<DynamicImage>,
    /// 0 stretch, 1 crop-and-fit, 2 fit-and-pad, 3 resize in latent space.
    pub resize_mode: u8,
    pub image_mask: Option<DynamicImage>,
    pub mask_blur_x: f32,
    pub mask_blur_y: f32,
    pub inpainting_fill: InpaintFill,
    /// Restrict sampling to the masked region at full model resolution,
    /// pasting the result back afterwards.
    pub inpaint_full_res: bool,
    pub inpaint_full_res_padding: u32,
    pub inpainting_mask_invert: bool,
    /// Multiplier on the initial noise; falls back to the global option.
    pub initial_noise_multiplier: Option<f64>,
    /// Secondary guidance scale for instruction-edit checkpoints.
    pub image_cfg_scale: Option<f64>,
    /// Overrides the blend mask used for latent compositing.
    pub latent_mask: Option<DynamicImage>,
    /// Snap mask values to 0/1 at latent resolution.
    pub mask_round: bool,

    // Derived during setup.
    pub init_latent: Option<Tensor<B, 4>>,
    /// Keep-original weights at latent resolution, `[1, c, lh, lw]`.
    pub mask: Option<Tensor<B, 4>>,
    /// Regenerate weights, the complement of `mask`.
    pub nmask: Option<Tensor<B, 4>>,
    pub image_conditioning: Option<ImageConditioning<B>>,
    pub overlay_images: Vec<RgbaImage>,
    /// Crop-region placement for full-resolution inpainting.
    pub paste_to: Option<(u32, u32, u32, u32)>,
    pub mask_for_overlay: Option<GrayImage>,
    pub init_img_hash: Option<String>,
}

impl<B: Backend> Default for Image2ImageParams<B> {
    fn default() -> Self {
        Self {
            init_images: Vec::new(),
            resize_mode: 0,
            image_mask: None,
            mask_blur_x: 4.0,
            mask_blur_y: 4.0,
            inpainting_fill: InpaintFill::default(),
            inpaint_full_res: false,
            inpaint_full_res_padding: 32,
            inpainting_mask_invert: false,
            initial_noise_multiplier: None,
            image_cfg_scale: None,
            latent_mask: None,
            mask_round: true,
            init_latent: None,
            mask: None,
            nmask: None,
            image_conditioning: None,
            overlay_images: Vec::new(),
            paste_to: None,
            mask_for_overlay: None,
            init_img_hash: None,
        }
    }
}

impl<B: Backend> Image2ImageParams<B> {
    /// Sets both blur radii at once.
    pub fn set_mask_blur(&mut self, sigma: f32) {
        self.mask_blur_x = sigma;
        self.mask_blur_y = sigma;
    }
}

/// The two entry points of the pipeline.
#[derive(Debug, Clone)]
pub enum RequestKind<B: Backend> {
    Text2Image(Text2ImageParams),
    Image2Image(Image2ImageParams<B>),
}

/// A full generation request.
///
/// Construct with [`GenerationRequest::text2image`] or
/// [`GenerationRequest::image2image`] and adjust fields directly; the
/// `all_*` vectors and the per-kind derived fields are filled in by the
/// pipeline.
#[derive(Debug, Clone)]
pub struct GenerationRequest<B: Backend> {
    pub prompt: Prompts,
    pub negative_prompt: Prompts,
    /// Style names applied to both prompts before expansion.
    pub styles: Vec<String>,
    pub steps: usize,
    pub sampler_name: String,
    pub cfg_scale: f64,
    pub width: u32,
    pub height: u32,
    pub seed: i64,
    pub subseed: i64,
    pub subseed_strength: f64,
    pub seed_resize_from_w: u32,
    pub seed_resize_from_h: u32,
    /// When false, the variation and resize seed fields are cleared.
    pub seed_enable_extras: bool,
    pub batch_size: usize,
    pub n_iter: usize,
    pub tiling: bool,
    pub eta: Option<f64>,
    pub denoising_strength: Option<f64>,
    pub do_not_reload_embeddings: bool,
    pub disable_extra_networks: bool,
    pub user: Option<String>,
    /// Option overrides applied for the duration of this request.
    pub override_settings: BTreeMap<String, serde_json::Value>,
    pub override_settings_restore_afterwards: bool,
    /// Extra `key: value` pairs appended to the infotext, in order.
    pub extra_generation_params: Vec<(String, String)>,
    pub comments: Vec<String>,
    pub kind: RequestKind<B>,

    // Filled in while the request runs.
    pub all_prompts: Vec<String>,
    pub all_negative_prompts: Vec<String>,
    pub all_seeds: Vec<i64>,
    pub all_subseeds: Vec<i64>,
    pub iteration: usize,
    pub extra_network_data: ExtraNetworkData,
    pub is_using_inpainting_conditioning: bool,
}

impl<B: Backend> GenerationRequest<B> {
    pub fn text2image() -> Self {
        Self::with_kind(RequestKind::Text2Image(Text2ImageParams::default()))
    }

    pub fn image2image(init_images: Vec<DynamicImage>) -> Self {
        let mut request = Self::with_kind(RequestKind::Image2Image(Image2ImageParams {
            init_images,
            ..Image2ImageParams::default()
        }));
        request.denoising_strength = Some(0.75);
        request
    }

    fn with_kind(kind: RequestKind<B>) -> Self {
        Self {
            prompt: Prompts::default(),
            negative_prompt: Prompts::default(),
            styles: Vec::new(),
            steps: 50,
            sampler_name: "Euler a".to_string(),
            cfg_scale: 7.0,
            width: 512,
            height: 512,
            seed: -1,
            subseed: -1,
            subseed_strength: 0.0,
            seed_resize_from_w: 0,
            seed_resize_from_h: 0,
            seed_enable_extras: true,
            batch_size: 1,
            n_iter: 1,
            tiling: false,
            eta: None,
            denoising_strength: None,
            do_not_reload_embeddings: false,
            disable_extra_networks: false,
            user: None,
            override_settings: BTreeMap::new(),
            override_settings_restore_afterwards: true,
            extra_generation_params: Vec::new(),
            comments: Vec::new(),
            kind,
            all_prompts: Vec::new(),
            all_negative_prompts: Vec::new(),
            all_seeds: Vec::new(),
            all_subseeds: Vec::new(),
            iteration: 0,
            extra_network_data: ExtraNetworkData::new(),
            is_using_inpainting_conditioning: false,
        }
    }

    /// Prompt representing the whole run in summary metadata.
    pub fn main_prompt(&self) -> &str {
        self.all_prompts.first().map(String::as_str).unwrap_or("")
    }

    pub fn hires_enabled(&self) -> bool {
        matches!(&self.kind, RequestKind::Text2Image(t2i) if t2i.enable_hr)
    }

    pub fn image_cfg_scale(&self) -> Option<f64> {
        match &self.kind {
            RequestKind::Image2Image(i2i) => i2i.image_cfg_scale,
            RequestKind::Text2Image(_) => None,
        }
    }

    pub fn init_image_hash(&self) -> Option<String> {
        match &self.kind {
            RequestKind::Image2Image(i2i) => i2i.init_img_hash.clone(),
            RequestKind::Text2Image(_) => None,
        }
    }

    /// Effective token-merging ratio, with the image-to-image and
    /// high-resolution settings falling back to the base one.
    pub fn token_merging_ratio(&self, options: &Options, for_hr: bool) -> f32 {
        let base = match &self.kind {
            RequestKind::Image2Image(_) => non_zero_or(
                options.token_merging_ratio_img2img,
                options.token_merging_ratio,
            ),
            RequestKind::Text2Image(_) => options.token_merging_ratio,
        };
        if for_hr {
            non_zero_or(options.token_merging_ratio_hr, base)
        } else {
            base
        }
    }

    /// Adds or replaces an infotext parameter.
    pub fn set_extra_param(&mut self, key: &str, value: String) {
        match self
            .extra_generation_params
            .iter_mut()
            .find(|(existing, _)| existing == key)
        {
            Some((_, existing)) => *existing = value,
            None => self.extra_generation_params.push((key.to_string(), value)),
        }
    }

    pub fn remove_extra_param(&mut self, key: &str) -> Option<String> {
        let index = self
            .extra_generation_params
            .iter()
            .position(|(existing, _)| existing == key)?;
        Some(self.extra_generation_params.remove(index).1)
    }

    /// Records a deduplicated comment surfaced in the run result.
    pub fn comment(&mut self, text: impl Into<String>) {
        let text = text.into();
        if !self.comments.contains(&text) {
            self.comments.push(text);
        }
    }
}

fn non_zero_or(value: f32, fallback: f32) -> f32 {
    if value != 0.0 {
        value
    } else {
        fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn single_prompt_expands_to_every_image() {
        let prompts = Prompts::from("a cat");
        assert_eq!(
            prompts.expand(3).unwrap(),
            vec!["a cat".to_string(), "a cat".to_string(), "a cat".to_string()]
        );
    }

    #[test]
    fn per_image_prompts_must_cover_the_run() {
        let prompts = Prompts::from(vec!["a".to_string(), "b".to_string()]);
        assert!(prompts.expand(2).is_ok());
        assert!(matches!(
            prompts.expand(4),
            Err(ProcessError::PromptCount {
                expected: 4,
                found: 2
            })
        ));
        assert!(matches!(
            Prompts::PerImage(Vec::new()).expand(1),
            Err(ProcessError::EmptyPrompt)
        ));
    }

    #[test]
    fn token_merging_falls_back_through_the_settings() {
        let mut options = Options::default();
        options.token_merging_ratio = 0.3;
        options.token_merging_ratio_hr = 0.0;

        let request = GenerationRequest::<TestBackend>::text2image();
        assert_eq!(request.token_merging_ratio(&options, false), 0.3);
        assert_eq!(request.token_merging_ratio(&options, true), 0.3);

        options.token_merging_ratio_hr = 0.5;
        assert_eq!(request.token_merging_ratio(&options, true), 0.5);

        options.token_merging_ratio_img2img = 0.2;
        let request = GenerationRequest::<TestBackend>::image2image(Vec::new());
        assert_eq!(request.token_merging_ratio(&options, false), 0.2);
    }

    #[test]
    fn extra_params_replace_in_place() {
        let mut request = GenerationRequest::<TestBackend>::text2image();
        request.set_extra_param("Hires upscale", "2".to_string());
        request.set_extra_param("Hires steps", "10".to_string());
        request.set_extra_param("Hires upscale", "4".to_string());

        assert_eq!(
            request.extra_generation_params,
            vec![
                ("Hires upscale".to_string(), "4".to_string()),
                ("Hires steps".to_string(), "10".to_string()),
            ]
        );

        assert_eq!(
            request.remove_extra_param("Hires upscale"),
            Some("4".to_string())
        );
        assert_eq!(request.remove_extra_param("Hires upscale"), None);
    }

    #[test]
    fn comments_deduplicate() {
        let mut request = GenerationRequest::<TestBackend>::text2image();
        request.comment("clip skip clamped");
        request.comment("clip skip clamped");
        assert_eq!(request.comments.len(), 1);
    }
}
