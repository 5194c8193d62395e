//! The assembled output of a run.

use image::RgbImage;
use serde_json::json;

/// Images plus everything needed to reproduce or describe them.
///
/// The scalar fields echo the request as it ran, after overrides and any
/// setup-time adjustments (disabled high-resolution pass, shrunk batch).
#[derive(Debug, Clone, Default)]
pub struct Processed {
    pub images: Vec<RgbImage>,
    /// One infotext per image, in the same order.
    pub infotexts: Vec<String>,
    pub index_of_first_image: usize,

    pub prompt: String,
    pub negative_prompt: String,
    pub all_prompts: Vec<String>,
    pub all_negative_prompts: Vec<String>,
    pub seed: i64,
    pub subseed: i64,
    pub subseed_strength: f64,
    pub all_seeds: Vec<i64>,
    pub all_subseeds: Vec<i64>,
    pub seed_resize_from_w: u32,
    pub seed_resize_from_h: u32,

    pub width: u32,
    pub height: u32,
    pub steps: usize,
    pub sampler_name: String,
    pub cfg_scale: f64,
    pub image_cfg_scale: Option<f64>,
    pub batch_size: usize,
    pub denoising_strength: Option<f64>,
    pub clip_skip: u32,

    pub model_name: String,
    pub model_hash: Option<String>,
    pub styles: Vec<String>,
    pub extra_generation_params: Vec<(String, String)>,
    pub is_using_inpainting_conditioning: bool,
    /// Newline-joined warnings collected during the run.
    pub comments: String,
}

impl Processed {
    /// Serializes the reproduction parameters (everything but the images).
    pub fn js(&self) -> serde_json::Value {
        json!({
            "prompt": self.prompt,
            "all_prompts": self.all_prompts,
            "negative_prompt": self.negative_prompt,
            "all_negative_prompts": self.all_negative_prompts,
            "seed": self.seed,
            "all_seeds": self.all_seeds,
            "subseed": self.subseed,
            "all_subseeds": self.all_subseeds,
            "subseed_strength": self.subseed_strength,
            "width": self.width,
            "height": self.height,
            "sampler_name": self.sampler_name,
            "cfg_scale": self.cfg_scale,
            "image_cfg_scale": self.image_cfg_scale,
            "steps": self.steps,
            "batch_size": self.batch_size,
            "model_name": self.model_name,
            "model_hash": self.model_hash,
            "seed_resize_from_w": self.seed_resize_from_w,
            "seed_resize_from_h": self.seed_resize_from_h,
            "denoising_strength": self.denoising_strength,
            "extra_generation_params": self.extra_generation_params
                .iter()
                .cloned()
                .collect::<std::collections::BTreeMap<_, _>>(),
            "index_of_first_image": self.index_of_first_image,
            "infotexts": self.infotexts,
            "styles": self.styles,
            "clip_skip": self.clip_skip,
            "is_using_inpainting_conditioning": self.is_using_inpainting_conditioning,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialization_skips_images() {
        let processed = Processed {
            images: vec![RgbImage::new(4, 4)],
            prompt: "a cat".to_string(),
            seed: 42,
            ..Processed::default()
        };

        let value = processed.js();
        assert_eq!(value["prompt"], "a cat");
        assert_eq!(value["seed"], 42);
        assert!(value.get("images").is_none());
    }
}
