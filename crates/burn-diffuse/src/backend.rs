//! The model-side interface of the pipeline.
//!
//! Everything neural lives behind [`DiffusionBackend`]: text conditioning,
//! first-stage encode/decode, the denoising samplers, and the auxiliary
//! models some checkpoints carry (depth estimator, image embedder). The
//! orchestration code only ever moves tensors between these calls.

use burn::tensor::backend::Backend;
use burn::tensor::ops::InterpolateMode;
use burn::tensor::Tensor;

use crate::image_conditioning::{ConditioningScheme, ImageConditioning};
use crate::networks::ExtraNetworkData;

/// Identity of the loaded checkpoint, echoed into image metadata and mixed
/// into conditioning-cache keys.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CheckpointInfo {
    pub name: String,
    /// Short hash, when known.
    pub hash: Option<String>,
}

impl CheckpointInfo {
    /// Stable identity string for cache keys.
    pub fn cache_identity(&self) -> String {
        match &self.hash {
            Some(hash) => format!("{} [{}]", self.name, hash),
            None => self.name.clone(),
        }
    }
}

/// Precision hint for first-stage decoding; the pipeline retries a decode
/// that produced non-finite values once at full precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodePrecision {
    #[default]
    Default,
    Full,
}

/// A denoising sampler known to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplerInfo {
    pub name: String,
    /// Whether the sampler can continue from an existing latent
    /// (image-to-image and the high-resolution pass need this).
    pub continuation: bool,
    /// Second-order samplers evaluate the model twice per step, which
    /// doubles the step count seen by step-dependent conditioning.
    pub second_order: bool,
}

impl SamplerInfo {
    fn new(name: &str, continuation: bool, second_order: bool) -> Self {
        Self {
            name: name.to_string(),
            continuation,
            second_order,
        }
    }
}

/// Substitute used when a request names a sampler that cannot continue
/// from an existing latent.
pub const CONTINUATION_FALLBACK: &str = "DDIM";

/// The sampler table of a typical backend.
pub fn default_samplers() -> Vec<SamplerInfo> {
    vec![
        SamplerInfo::new("Euler a", true, false),
        SamplerInfo::new("Euler", true, false),
        SamplerInfo::new("Heun", true, true),
        SamplerInfo::new("DPM++ 2M", true, false),
        SamplerInfo::new("DPM++ SDE", true, true),
        SamplerInfo::new("DDIM", true, false),
        SamplerInfo::new("PLMS", false, false),
        SamplerInfo::new("UniPC", false, false),
    ]
}

pub fn find_sampler<'a>(samplers: &'a [SamplerInfo], name: &str) -> Option<&'a SamplerInfo> {
    samplers.iter().find(|s| s.name == name)
}

/// Resolves the sampler to use for a continuation pass, silently swapping
/// in [`CONTINUATION_FALLBACK`] when the named one cannot continue.
pub fn continuation_sampler(samplers: &[SamplerInfo], name: &str) -> String {
    match find_sampler(samplers, name) {
        Some(info) if !info.continuation => {
            log::warn!(
                "sampler {} does not support continuing from an existing image, using {} instead",
                info.name,
                CONTINUATION_FALLBACK
            );
            CONTINUATION_FALLBACK.to_string()
        }
        _ => name.to_string(),
    }
}

/// Step-count multiplier applied when building conditioning-cache keys.
pub fn step_multiplier(samplers: &[SamplerInfo], name: &str) -> usize {
    match find_sampler(samplers, name) {
        Some(info) if info.second_order => 2,
        _ => 1,
    }
}

/// Named latent-space upscale modes selectable for the high-resolution
/// pass; any other upscaler name goes through the pixel-space registry.
pub fn latent_upscale_mode(name: &str) -> Option<InterpolateMode> {
    match name {
        "Latent" | "Latent (antialiased)" => Some(InterpolateMode::Bilinear),
        "Latent (bicubic)" | "Latent (bicubic antialiased)" => Some(InterpolateMode::Bicubic),
        "Latent (nearest)" | "Latent (nearest-exact)" => Some(InterpolateMode::Nearest),
        _ => None,
    }
}

/// Scalar knobs handed to the sampler.
#[derive(Debug, Clone)]
pub struct SampleParams {
    pub sampler_name: String,
    pub steps: usize,
    pub cfg_scale: f64,
    pub image_cfg_scale: Option<f64>,
    pub denoising_strength: Option<f64>,
    pub eta: Option<f64>,
    pub width: u32,
    pub height: u32,
}

/// Positive/negative text conditioning for one batch.
#[derive(Debug, Clone)]
pub struct Conditioning<B: Backend> {
    pub cond: Tensor<B, 3>,
    pub uncond: Tensor<B, 3>,
}

/// The neural collaborator driving actual image generation.
///
/// Tensor-producing methods are infallible; a backend signals trouble
/// through the values it returns (the pipeline checks decodes for
/// non-finite output). Batch dimension conventions: images are
/// `[batch, 3, height, width]` in `[-1, 1]`, latents
/// `[batch, channels, height/8, width/8]`.
pub trait DiffusionBackend<B: Backend> {
    fn device(&self) -> B::Device;

    fn checkpoint(&self) -> CheckpointInfo;

    fn conditioning_scheme(&self) -> ConditioningScheme;

    fn latent_channels(&self) -> usize {
        4
    }

    fn samplers(&self) -> Vec<SamplerInfo> {
        default_samplers()
    }

    /// Text conditioning for a batch of prompts, one row per prompt.
    fn learned_conditioning(&self, prompts: &[String], steps: usize, clip_skip: u32)
        -> Tensor<B, 3>;

    /// Stochastic first-stage encode.
    fn encode_first_stage(&self, images: Tensor<B, 4>) -> Tensor<B, 4>;

    /// Distribution-mode first-stage encode, for conditioning that must
    /// not carry sampling noise.
    fn encode_first_stage_deterministic(&self, images: Tensor<B, 4>) -> Tensor<B, 4>;

    fn decode_first_stage(&self, latents: Tensor<B, 4>, precision: DecodePrecision)
        -> Tensor<B, 4>;

    /// Runs the sampler from pure noise.
    fn sample(
        &mut self,
        params: &SampleParams,
        conditioning: &Conditioning<B>,
        noise: Tensor<B, 4>,
        image_conditioning: &ImageConditioning<B>,
    ) -> Tensor<B, 4>;

    /// Runs the sampler from an existing latent plus noise.
    fn sample_img2img(
        &mut self,
        params: &SampleParams,
        conditioning: &Conditioning<B>,
        init_latent: Tensor<B, 4>,
        noise: Tensor<B, 4>,
        image_conditioning: &ImageConditioning<B>,
    ) -> Tensor<B, 4>;

    /// Depth map `[batch, 1, h, w]` for depth-conditioned checkpoints.
    fn depth_estimate(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch, _, height, width] = images.dims();
        Tensor::zeros([batch, 1, height, width], &self.device())
    }

    /// Image embedding for unCLIP-style checkpoints.
    fn image_embed(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch, _, _, _] = images.dims();
        Tensor::zeros([batch, self.adm_channels()], &self.device())
    }

    /// Width of the embedding produced by [`image_embed`](Self::image_embed).
    fn adm_channels(&self) -> usize {
        1536
    }

    /// Toggles circular (tiling) padding in the convolution layers.
    fn apply_circular(&mut self, enabled: bool) {
        let _ = enabled;
    }

    /// Picks up newly added textual-inversion embeddings.
    fn reload_embeddings(&mut self) {}

    fn apply_token_merging(&mut self, ratio: f32) {
        let _ = ratio;
    }

    fn activate_extra_networks(&mut self, data: &ExtraNetworkData) {
        let _ = data;
    }

    fn deactivate_extra_networks(&mut self, data: &ExtraNetworkData) {
        let _ = data;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_finds_exact_names() {
        let samplers = default_samplers();
        assert!(find_sampler(&samplers, "Euler a").is_some());
        assert!(find_sampler(&samplers, "euler a").is_none());
    }

    #[test]
    fn non_continuation_samplers_get_substituted() {
        let samplers = default_samplers();
        assert_eq!(continuation_sampler(&samplers, "UniPC"), "DDIM");
        assert_eq!(continuation_sampler(&samplers, "PLMS"), "DDIM");
        assert_eq!(continuation_sampler(&samplers, "Euler a"), "Euler a");
    }

    #[test]
    fn second_order_doubles_the_step_multiplier() {
        let samplers = default_samplers();
        assert_eq!(step_multiplier(&samplers, "Heun"), 2);
        assert_eq!(step_multiplier(&samplers, "Euler"), 1);
        assert_eq!(step_multiplier(&samplers, "unknown"), 1);
    }

    #[test]
    fn latent_mode_names_map_to_interpolation() {
        assert!(matches!(latent_upscale_mode("Latent"), Some(InterpolateMode::Bilinear)));
        assert!(matches!(
            latent_upscale_mode("Latent (nearest)"),
            Some(InterpolateMode::Nearest)
        ));
        assert!(latent_upscale_mode("ESRGAN 4x").is_none());
    }
}
