//! Generation-parameter text attached to every output image.
//!
//! The format is line-oriented and stable, since frontends parse it back:
//! the prompt, an optional `Negative prompt:` line, then one line of
//! comma-separated `key: value` pairs in a fixed order. Values containing
//! a comma, colon or newline are JSON-quoted.

use burn::tensor::backend::Backend;

use crate::backend::CheckpointInfo;
use crate::options::Options;
use crate::request::GenerationRequest;

/// Version string recorded in metadata when enabled.
pub const VERSION: &str = concat!("v", env!("CARGO_PKG_VERSION"));

/// Quotes a value if it would break the `key: value, key: value` framing.
pub fn quote(value: &str) -> String {
    if !value.contains(',') && !value.contains('\n') && !value.contains(':') {
        return value.to_string();
    }
    serde_json::to_string(value).unwrap_or_else(|_| value.to_string())
}

/// Formats a float the way frontends expect: no trailing `.0` on whole
/// numbers.
pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

/// Same, for single-precision settings values. Widening to `f64` first
/// would drag in garbage digits (`0.4f32 as f64` is `0.40000000596...`).
pub fn format_number_f32(value: f32) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

/// Joins ordered pairs into the parameter line. `None` values are omitted;
/// a pair whose value equals its key collapses to the bare key.
pub fn format_params(pairs: &[(String, Option<String>)]) -> String {
    pairs
        .iter()
        .filter_map(|(key, value)| {
            value.as_ref().map(|value| {
                if key == value {
                    key.clone()
                } else {
                    format!("{}: {}", key, quote(value))
                }
            })
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Builds the full infotext for image `position_in_batch` of iteration
/// `iteration`.
pub fn create_infotext<B: Backend>(
    p: &GenerationRequest<B>,
    options: &Options,
    checkpoint: &CheckpointInfo,
    iteration: usize,
    position_in_batch: usize,
    use_main_prompt: bool,
) -> String {
    let index = position_in_batch + iteration * p.batch_size;
    let token_merging_ratio = p.token_merging_ratio(options, false);
    let token_merging_ratio_hr = p.token_merging_ratio(options, true);

    let mut pairs: Vec<(String, Option<String>)> = Vec::new();
    let mut push = |key: &str, value: Option<String>| pairs.push((key.to_string(), value));

    push("Steps", Some(p.steps.to_string()));
    push("Sampler", Some(p.sampler_name.clone()));
    push("CFG scale", Some(format_number(p.cfg_scale)));
    push("Image CFG scale", p.image_cfg_scale().map(format_number));
    push("Seed", Some(p.all_seeds[index].to_string()));
    push("Size", Some(format!("{}x{}", p.width, p.height)));
    push(
        "Model hash",
        if options.add_model_hash_to_info {
            checkpoint.hash.clone()
        } else {
            None
        },
    );
    push(
        "Model",
        options
            .add_model_name_to_info
            .then(|| checkpoint.name.clone()),
    );
    push(
        "Variation seed",
        (p.subseed_strength != 0.0).then(|| p.all_subseeds[index].to_string()),
    );
    push(
        "Variation seed strength",
        (p.subseed_strength != 0.0).then(|| format_number(p.subseed_strength)),
    );
    push(
        "Seed resize from",
        (p.seed_resize_from_w > 0 && p.seed_resize_from_h > 0)
            .then(|| format!("{}x{}", p.seed_resize_from_w, p.seed_resize_from_h)),
    );
    push("Denoising strength", p.denoising_strength.map(format_number));
    push(
        "Conditional mask weight",
        p.is_using_inpainting_conditioning
            .then(|| format_number(options.inpainting_mask_weight)),
    );
    push(
        "Clip skip",
        (options.clip_skip > 1).then(|| options.clip_skip.to_string()),
    );
    push(
        "Token merging ratio",
        (token_merging_ratio != 0.0).then(|| format_number_f32(token_merging_ratio)),
    );
    push(
        "Token merging ratio hr",
        (p.hires_enabled() && token_merging_ratio_hr != 0.0)
            .then(|| format_number_f32(token_merging_ratio_hr)),
    );
    push("Init image hash", p.init_image_hash());
    push("Tiling", p.tiling.then(|| "True".to_string()));
    for (key, value) in &p.extra_generation_params {
        pairs.push((key.clone(), Some(value.clone())));
    }
    pairs.push((
        "Version".to_string(),
        options.add_version_to_infotext.then(|| VERSION.to_string()),
    ));
    pairs.push((
        "User".to_string(),
        if options.add_user_name_to_info {
            p.user.clone()
        } else {
            None
        },
    ));

    let prompt = if use_main_prompt {
        p.main_prompt()
    } else {
        p.all_prompts[index].as_str()
    };
    let negative = p.all_negative_prompts[index].as_str();
    format_infotext(prompt, negative, &format_params(&pairs))
}

/// Assembles the three-line layout.
pub fn format_infotext(prompt: &str, negative_prompt: &str, params: &str) -> String {
    let negative = if negative_prompt.is_empty() {
        String::new()
    } else {
        format!("\nNegative prompt: {negative_prompt}")
    };
    format!("{prompt}{negative}\n{params}").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_values_stay_unquoted() {
        assert_eq!(quote("20"), "20");
        assert_eq!(quote("Euler a"), "Euler a");
    }

    #[test]
    fn separator_characters_trigger_json_quoting() {
        assert_eq!(quote("a,b"), "\"a,b\"");
        assert_eq!(quote("k: v"), "\"k: v\"");
        assert_eq!(quote("line\nbreak"), "\"line\\nbreak\"");
    }

    #[test]
    fn params_line_matches_expected_layout() {
        let pairs = vec![
            ("Steps".to_string(), Some("20".to_string())),
            ("Hidden".to_string(), None),
            ("Tiling".to_string(), Some("True".to_string())),
        ];
        assert_eq!(format_params(&pairs), "Steps: 20, Tiling: True");
    }

    #[test]
    fn key_equal_to_value_collapses() {
        let pairs = vec![("Hires fix".to_string(), Some("Hires fix".to_string()))];
        assert_eq!(format_params(&pairs), "Hires fix");
    }

    #[test]
    fn numbers_drop_trailing_zero() {
        assert_eq!(format_number(7.0), "7");
        assert_eq!(format_number(0.75), "0.75");
        assert_eq!(format_number(-2.0), "-2");
        assert_eq!(format_number_f32(0.4), "0.4");
        assert_eq!(format_number_f32(1.0), "1");
    }

    #[test]
    fn negative_prompt_line_is_conditional() {
        let with = format_infotext("a cat", "blurry", "Steps: 20");
        assert_eq!(with, "a cat\nNegative prompt: blurry\nSteps: 20");

        let without = format_infotext("a cat", "", "Steps: 20");
        assert_eq!(without, "a cat\nSteps: 20");
    }
}
