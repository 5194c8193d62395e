//! Runtime options and prompt styles.
//!
//! Options are an owned value passed into the pipeline by reference, not a
//! global. They deserialize with defaults for absent fields, so a partial
//! config file loads cleanly. A request's override-settings map can change
//! them for the duration of one run; the pipeline captures the prior values
//! and restores them afterwards unless the request opts out.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Override keys that are silently dropped. These control resource
/// lifetime beyond a single run, which a per-request override must not
/// reach.
pub const RESTRICTED_OVERRIDE_KEYS: &[&str] = &["persistent_cond_cache"];

/// Tunables consulted throughout a generation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Number of CLIP layers to stop at, counted from the end. 1 means the
    /// full text encoder.
    pub clip_skip: u32,
    /// Weight of the masked-content blend fed to inpainting-conditioned
    /// models; below 1.0 the conditioning keeps some of the original.
    pub inpainting_mask_weight: f64,
    /// Multiplier applied to the initial image-to-image noise.
    pub initial_noise_multiplier: f64,
    /// Keep conditioning caches alive across runs.
    pub persistent_cond_cache: bool,
    /// Crop offsets baked into the conditioning of models that take them.
    pub sdxl_crop_left: u32,
    pub sdxl_crop_top: u32,
    /// Token merging ratios (0 disables merging).
    pub token_merging_ratio: f32,
    pub token_merging_ratio_img2img: f32,
    pub token_merging_ratio_hr: f32,
    /// Upscaler name used when the high-resolution pass does not name one.
    pub latent_upscale_default_mode: String,
    /// Compute high-resolution conditioning together with the first pass.
    pub hires_fix_use_firstpass_conds: bool,
    /// Legacy sizing: treat width/height as the final resolution and derive
    /// a roughly 512x512 first pass from them.
    pub use_old_hires_fix_width_height: bool,
    /// Background color composited under transparent source images.
    pub img2img_background_color: [u8; 3],
    pub add_model_name_to_info: bool,
    pub add_model_hash_to_info: bool,
    pub add_version_to_infotext: bool,
    pub add_user_name_to_info: bool,
    /// Prompt styles available for requests to reference by name.
    pub styles: Vec<PromptStyle>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            clip_skip: 1,
            inpainting_mask_weight: 1.0,
            initial_noise_multiplier: 1.0,
            persistent_cond_cache: true,
            sdxl_crop_left: 0,
            sdxl_crop_top: 0,
            token_merging_ratio: 0.0,
            token_merging_ratio_img2img: 0.0,
            token_merging_ratio_hr: 0.0,
            latent_upscale_default_mode: "Latent".to_string(),
            hires_fix_use_firstpass_conds: false,
            use_old_hires_fix_width_height: false,
            img2img_background_color: [255, 255, 255],
            add_model_name_to_info: true,
            add_model_hash_to_info: true,
            add_version_to_infotext: true,
            add_user_name_to_info: false,
            styles: Vec::new(),
        }
    }
}

impl Options {
    /// Applies an override-settings map, returning the prior values so the
    /// caller can undo the changes. Restricted and unknown keys are dropped
    /// with a log line.
    pub fn apply_overrides(&mut self, overrides: &BTreeMap<String, Value>) -> Vec<(String, Value)> {
        let mut prior = Vec::new();
        for (key, value) in overrides {
            if RESTRICTED_OVERRIDE_KEYS.contains(&key.as_str()) {
                log::debug!("ignoring restricted override: {key}");
                continue;
            }
            match self.snapshot(key) {
                Some(old) => {
                    if self.set(key, value) {
                        prior.push((key.clone(), old));
                    }
                }
                None => log::warn!("ignoring unknown override: {key}"),
            }
        }
        prior
    }

    /// Undoes a previous [`apply_overrides`](Self::apply_overrides).
    pub fn restore(&mut self, prior: Vec<(String, Value)>) {
        for (key, value) in prior {
            self.set(&key, &value);
        }
    }

    fn snapshot(&self, key: &str) -> Option<Value> {
        let value = match key {
            "clip_skip" => Value::from(self.clip_skip),
            "inpainting_mask_weight" => Value::from(self.inpainting_mask_weight),
            "initial_noise_multiplier" => Value::from(self.initial_noise_multiplier),
            "sdxl_crop_left" => Value::from(self.sdxl_crop_left),
            "sdxl_crop_top" => Value::from(self.sdxl_crop_top),
            "token_merging_ratio" => Value::from(self.token_merging_ratio),
            "token_merging_ratio_img2img" => Value::from(self.token_merging_ratio_img2img),
            "token_merging_ratio_hr" => Value::from(self.token_merging_ratio_hr),
            "latent_upscale_default_mode" => Value::from(self.latent_upscale_default_mode.clone()),
            "hires_fix_use_firstpass_conds" => Value::from(self.hires_fix_use_firstpass_conds),
            "use_old_hires_fix_width_height" => Value::from(self.use_old_hires_fix_width_height),
            _ => return None,
        };
        Some(value)
    }

    fn set(&mut self, key: &str, value: &Value) -> bool {
        match key {
            "clip_skip" => assign_u32(&mut self.clip_skip, value),
            "inpainting_mask_weight" => assign_f64(&mut self.inpainting_mask_weight, value),
            "initial_noise_multiplier" => assign_f64(&mut self.initial_noise_multiplier, value),
            "sdxl_crop_left" => assign_u32(&mut self.sdxl_crop_left, value),
            "sdxl_crop_top" => assign_u32(&mut self.sdxl_crop_top, value),
            "token_merging_ratio" => assign_f32(&mut self.token_merging_ratio, value),
            "token_merging_ratio_img2img" => assign_f32(&mut self.token_merging_ratio_img2img, value),
            "token_merging_ratio_hr" => assign_f32(&mut self.token_merging_ratio_hr, value),
            "latent_upscale_default_mode" => {
                if let Some(s) = value.as_str() {
                    self.latent_upscale_default_mode = s.to_string();
                    true
                } else {
                    false
                }
            }
            "hires_fix_use_firstpass_conds" => assign_bool(&mut self.hires_fix_use_firstpass_conds, value),
            "use_old_hires_fix_width_height" => assign_bool(&mut self.use_old_hires_fix_width_height, value),
            _ => false,
        }
    }

    /// Looks up a style by name; unknown names are skipped with a warning
    /// so a stale style list does not fail the whole request.
    pub fn find_style(&self, name: &str) -> Option<&PromptStyle> {
        self.styles.iter().find(|s| s.name == name)
    }

    /// Applies the named styles to a positive prompt.
    pub fn apply_styles_to_prompt(&self, prompt: &str, names: &[String]) -> String {
        let mut result = prompt.to_string();
        for name in names {
            match self.find_style(name) {
                Some(style) => result = merge_prompts(&style.prompt, &result),
                None => log::warn!("style not found: {name}"),
            }
        }
        result
    }

    /// Applies the named styles to a negative prompt.
    pub fn apply_styles_to_negative_prompt(&self, prompt: &str, names: &[String]) -> String {
        let mut result = prompt.to_string();
        for name in names {
            if let Some(style) = self.find_style(name) {
                result = merge_prompts(&style.negative_prompt, &result);
            }
        }
        result
    }
}

fn assign_u32(slot: &mut u32, value: &Value) -> bool {
    match value.as_u64() {
        Some(v) => {
            *slot = v as u32;
            true
        }
        None => false,
    }
}

fn assign_f64(slot: &mut f64, value: &Value) -> bool {
    match value.as_f64() {
        Some(v) => {
            *slot = v;
            true
        }
        None => false,
    }
}

fn assign_f32(slot: &mut f32, value: &Value) -> bool {
    match value.as_f64() {
        Some(v) => {
            *slot = v as f32;
            true
        }
        None => false,
    }
}

fn assign_bool(slot: &mut bool, value: &Value) -> bool {
    match value.as_bool() {
        Some(v) => {
            *slot = v;
            true
        }
        None => false,
    }
}

/// A reusable prompt fragment referenced by name from requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptStyle {
    pub name: String,
    pub prompt: String,
    pub negative_prompt: String,
}

/// Merges a style into a prompt: a `{prompt}` placeholder in the style is
/// substituted, otherwise the style is appended after a comma.
fn merge_prompts(style_text: &str, prompt: &str) -> String {
    if style_text.contains("{prompt}") {
        style_text.replace("{prompt}", prompt)
    } else {
        let parts: Vec<&str> = [prompt.trim(), style_text.trim()]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect();
        parts.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options_with_style() -> Options {
        Options {
            styles: vec![
                PromptStyle {
                    name: "oil".into(),
                    prompt: "oil painting".into(),
                    negative_prompt: "photo".into(),
                },
                PromptStyle {
                    name: "framed".into(),
                    prompt: "a framed picture of {prompt}, ornate".into(),
                    negative_prompt: String::new(),
                },
            ],
            ..Options::default()
        }
    }

    #[test]
    fn style_appends_after_comma() {
        let opts = options_with_style();
        let out = opts.apply_styles_to_prompt("a cat", &["oil".to_string()]);
        assert_eq!(out, "a cat, oil painting");
    }

    #[test]
    fn style_placeholder_substitutes() {
        let opts = options_with_style();
        let out = opts.apply_styles_to_prompt("a cat", &["framed".to_string()]);
        assert_eq!(out, "a framed picture of a cat, ornate");
    }

    #[test]
    fn empty_prompt_does_not_leave_stray_comma() {
        let opts = options_with_style();
        let out = opts.apply_styles_to_prompt("", &["oil".to_string()]);
        assert_eq!(out, "oil painting");
    }

    #[test]
    fn overrides_apply_and_restore() {
        let mut opts = Options::default();
        let mut overrides = BTreeMap::new();
        overrides.insert("clip_skip".to_string(), Value::from(3u32));
        overrides.insert("inpainting_mask_weight".to_string(), Value::from(0.5));

        let prior = opts.apply_overrides(&overrides);
        assert_eq!(opts.clip_skip, 3);
        assert_eq!(opts.inpainting_mask_weight, 0.5);

        opts.restore(prior);
        assert_eq!(opts.clip_skip, 1);
        assert_eq!(opts.inpainting_mask_weight, 1.0);
    }

    #[test]
    fn partial_config_fills_in_defaults() {
        let opts: Options =
            serde_json::from_str(r#"{"clip_skip": 2, "latent_upscale_default_mode": "Latent (bicubic)"}"#)
                .unwrap();
        assert_eq!(opts.clip_skip, 2);
        assert_eq!(opts.latent_upscale_default_mode, "Latent (bicubic)");
        assert!(opts.persistent_cond_cache);
        assert_eq!(opts.inpainting_mask_weight, 1.0);
    }

    #[test]
    fn restricted_and_unknown_keys_are_dropped() {
        let mut opts = Options::default();
        let mut overrides = BTreeMap::new();
        overrides.insert("persistent_cond_cache".to_string(), Value::from(false));
        overrides.insert("no_such_option".to_string(), Value::from(1));

        let prior = opts.apply_overrides(&overrides);
        assert!(prior.is_empty());
        assert!(opts.persistent_cond_cache);
    }
}
