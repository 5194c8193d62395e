//! Per-checkpoint image conditioning.
//!
//! Some checkpoints want a second conditioning signal alongside the text:
//! inpainting models concatenate a mask and a masked-image latent onto the
//! sampler input, depth models a normalized depth map, instruction-edit
//! models the source latent, and unCLIP models an image embedding added to
//! the timestep embedding. The scheme is a property of the loaded
//! checkpoint and fixed for the whole run.

use burn::tensor::backend::Backend;
use burn::tensor::ops::InterpolateMode;
use burn::tensor::{Tensor, TensorData};
use image::GrayImage;

use burn_diffuse_rng::LATENT_FACTOR;

use crate::backend::DiffusionBackend;
use crate::latent::resize_latent;

/// How the loaded checkpoint consumes image conditioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConditioningScheme {
    /// Text-only checkpoint; a placeholder tensor keeps call shapes uniform.
    #[default]
    None,
    /// Inpainting checkpoint: mask plus masked-image latent, concatenated
    /// onto the sampler input channels.
    InpaintingHybrid,
    /// Depth-to-image checkpoint: normalized depth map at latent resolution.
    DepthConditioned,
    /// Instruction-edit checkpoint: deterministic latent of the source image.
    EditConditioned,
    /// unCLIP checkpoint: image embedding mixed into the timestep embedding.
    UnclipAdm,
}

/// The conditioning tensor in the layout the sampler expects.
#[derive(Debug, Clone)]
pub enum ImageConditioning<B: Backend> {
    /// Concatenated onto the sampler input along the channel dimension.
    Concat(Tensor<B, 4>),
    /// Added to the timestep embedding.
    Adm(Tensor<B, 2>),
}

/// Conditioning for generation from pure noise.
///
/// Inpainting checkpoints receive a fully-set mask over a mid-gray image,
/// which reads as "regenerate everything". Sizes derive from the latent so
/// the channels always line up with the sampler input.
pub fn txt2img_conditioning<B: Backend, M: DiffusionBackend<B> + ?Sized>(
    model: &M,
    latent: &Tensor<B, 4>,
) -> ImageConditioning<B> {
    let device = model.device();
    let [batch, _, latent_height, latent_width] = latent.dims();

    match model.conditioning_scheme() {
        ConditioningScheme::InpaintingHybrid => {
            let blank = Tensor::zeros(
                [
                    batch,
                    3,
                    latent_height * LATENT_FACTOR,
                    latent_width * LATENT_FACTOR,
                ],
                &device,
            );
            let encoded = model.encode_first_stage(blank);
            let mask = Tensor::ones([batch, 1, latent_height, latent_width], &device);
            ImageConditioning::Concat(Tensor::cat(vec![mask, encoded], 1))
        }
        ConditioningScheme::UnclipAdm => {
            ImageConditioning::Adm(Tensor::zeros([batch, model.adm_channels()], &device))
        }
        _ => ImageConditioning::Concat(Tensor::zeros([batch, 5, 1, 1], &device)),
    }
}

/// Conditioning for generation seeded by a source image.
///
/// `source` is the image batch in `[-1, 1]`, `latent` its encoded form.
/// `mask`, when present, is the full-resolution inpaint mask; absent, the
/// whole image counts as masked. `mask_weight` fades the masked-image
/// latent between the plain source (0) and the blacked-out source (1).
pub fn img2img_conditioning<B: Backend, M: DiffusionBackend<B> + ?Sized>(
    model: &M,
    source: &Tensor<B, 4>,
    latent: &Tensor<B, 4>,
    mask: Option<&GrayImage>,
    round_mask: bool,
    mask_weight: f64,
) -> ImageConditioning<B> {
    match model.conditioning_scheme() {
        ConditioningScheme::DepthConditioned => depth_conditioning(model, source, latent),
        ConditioningScheme::EditConditioned => {
            ImageConditioning::Concat(model.encode_first_stage_deterministic(source.clone()))
        }
        ConditioningScheme::InpaintingHybrid => {
            inpainting_conditioning(model, source, latent, mask, round_mask, mask_weight)
        }
        ConditioningScheme::UnclipAdm => {
            ImageConditioning::Adm(model.image_embed(source.clone()))
        }
        ConditioningScheme::None => {
            let [batch, _, _, _] = latent.dims();
            ImageConditioning::Concat(Tensor::zeros([batch, 5, 1, 1], &model.device()))
        }
    }
}

fn depth_conditioning<B: Backend, M: DiffusionBackend<B> + ?Sized>(
    model: &M,
    source: &Tensor<B, 4>,
    latent: &Tensor<B, 4>,
) -> ImageConditioning<B> {
    let [_, _, latent_height, latent_width] = latent.dims();
    let depth = resize_latent(
        model.depth_estimate(source.clone()),
        latent_height,
        latent_width,
        InterpolateMode::Bicubic,
    );

    let values = depth.clone().into_data().to_vec::<f32>().unwrap();
    let min = values.iter().copied().fold(f32::INFINITY, f32::min);
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max > min {
        // Normalize to [-1, 1] over the whole batch.
        let scaled = depth.sub_scalar(min).mul_scalar(2.0 / (max - min)).sub_scalar(1.0);
        ImageConditioning::Concat(scaled)
    } else {
        ImageConditioning::Concat(depth.zeros_like())
    }
}

fn inpainting_conditioning<B: Backend, M: DiffusionBackend<B> + ?Sized>(
    model: &M,
    source: &Tensor<B, 4>,
    latent: &Tensor<B, 4>,
    mask: Option<&GrayImage>,
    round_mask: bool,
    mask_weight: f64,
) -> ImageConditioning<B> {
    let device = model.device();
    let [_, _, source_height, source_width] = source.dims();
    let [_, _, latent_height, latent_width] = latent.dims();

    let mask_tensor = match mask {
        Some(mask) => {
            let mut values = Vec::with_capacity((mask.width() * mask.height()) as usize);
            for pixel in mask.pixels() {
                let v = pixel.0[0] as f32 / 255.0;
                values.push(if round_mask { v.round() } else { v });
            }
            let data = TensorData::new(
                values,
                [1, 1, mask.height() as usize, mask.width() as usize],
            );
            Tensor::<B, 4>::from_data(data, &device)
        }
        None => Tensor::ones([1, 1, source_height, source_width], &device),
    };

    // Interpolate between the source and the masked-out source, then encode.
    let faded = source.clone()
        - source
            .clone()
            .mul(mask_tensor.clone())
            .mul_scalar(mask_weight as f32);
    let encoded = model.encode_first_stage(faded);

    let [encoded_batch, _, _, _] = encoded.dims();
    let mask_latent = resize_latent(
        mask_tensor,
        latent_height,
        latent_width,
        InterpolateMode::Nearest,
    )
    .repeat_dim(0, encoded_batch);

    ImageConditioning::Concat(Tensor::cat(vec![mask_latent, encoded], 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CheckpointInfo, Conditioning, DecodePrecision, SampleParams};
    use burn_ndarray::NdArray;
    use image::Luma;

    type TestBackend = NdArray;

    struct FixtureModel {
        scheme: ConditioningScheme,
    }

    impl FixtureModel {
        fn downsample(&self, images: Tensor<TestBackend, 4>) -> Tensor<TestBackend, 4> {
            let [batch, _, height, width] = images.dims();
            let down = resize_latent(
                images,
                height / LATENT_FACTOR,
                width / LATENT_FACTOR,
                InterpolateMode::Nearest,
            );
            let first = down.clone().slice([0..batch, 0..1]);
            Tensor::cat(vec![down, first], 1)
        }
    }

    impl DiffusionBackend<TestBackend> for FixtureModel {
        fn device(&self) -> <TestBackend as burn::tensor::backend::Backend>::Device {
            Default::default()
        }

        fn checkpoint(&self) -> CheckpointInfo {
            CheckpointInfo::default()
        }

        fn conditioning_scheme(&self) -> ConditioningScheme {
            self.scheme
        }

        fn learned_conditioning(
            &self,
            prompts: &[String],
            _steps: usize,
            _clip_skip: u32,
        ) -> Tensor<TestBackend, 3> {
            Tensor::zeros([prompts.len(), 2, 4], &self.device())
        }

        fn encode_first_stage(&self, images: Tensor<TestBackend, 4>) -> Tensor<TestBackend, 4> {
            self.downsample(images)
        }

        fn encode_first_stage_deterministic(
            &self,
            images: Tensor<TestBackend, 4>,
        ) -> Tensor<TestBackend, 4> {
            self.downsample(images)
        }

        fn decode_first_stage(
            &self,
            latents: Tensor<TestBackend, 4>,
            _precision: DecodePrecision,
        ) -> Tensor<TestBackend, 4> {
            latents
        }

        fn sample(
            &mut self,
            _params: &SampleParams,
            _conditioning: &Conditioning<TestBackend>,
            noise: Tensor<TestBackend, 4>,
            _image_conditioning: &ImageConditioning<TestBackend>,
        ) -> Tensor<TestBackend, 4> {
            noise
        }

        fn sample_img2img(
            &mut self,
            _params: &SampleParams,
            _conditioning: &Conditioning<TestBackend>,
            init_latent: Tensor<TestBackend, 4>,
            _noise: Tensor<TestBackend, 4>,
            _image_conditioning: &ImageConditioning<TestBackend>,
        ) -> Tensor<TestBackend, 4> {
            init_latent
        }
    }

    fn latent(batch: usize) -> Tensor<TestBackend, 4> {
        Tensor::zeros([batch, 4, 8, 8], &Default::default())
    }

    fn source(batch: usize) -> Tensor<TestBackend, 4> {
        Tensor::zeros([batch, 3, 64, 64], &Default::default())
    }

    #[test]
    fn plain_checkpoints_get_placeholder_conditioning() {
        let model = FixtureModel {
            scheme: ConditioningScheme::None,
        };
        match txt2img_conditioning(&model, &latent(2)) {
            ImageConditioning::Concat(tensor) => assert_eq!(tensor.dims(), [2, 5, 1, 1]),
            ImageConditioning::Adm(_) => panic!("expected concat conditioning"),
        }
    }

    #[test]
    fn inpainting_txt2img_sets_the_whole_mask() {
        let model = FixtureModel {
            scheme: ConditioningScheme::InpaintingHybrid,
        };
        match txt2img_conditioning(&model, &latent(2)) {
            ImageConditioning::Concat(tensor) => {
                assert_eq!(tensor.dims(), [2, 5, 8, 8]);
                let mask = tensor.slice([0..2, 0..1]).into_data().to_vec::<f32>().unwrap();
                assert!(mask.iter().all(|v| *v == 1.0));
            }
            ImageConditioning::Adm(_) => panic!("expected concat conditioning"),
        }
    }

    #[test]
    fn inpainting_img2img_downsamples_the_mask() {
        let model = FixtureModel {
            scheme: ConditioningScheme::InpaintingHybrid,
        };
        // Left half masked at full resolution.
        let mask = GrayImage::from_fn(64, 64, |x, _| {
            if x < 32 {
                Luma([255u8])
            } else {
                Luma([0u8])
            }
        });

        match img2img_conditioning(&model, &source(1), &latent(1), Some(&mask), true, 1.0) {
            ImageConditioning::Concat(tensor) => {
                assert_eq!(tensor.dims(), [1, 5, 8, 8]);
                let mask = tensor
                    .slice([0..1, 0..1])
                    .into_data()
                    .to_vec::<f32>()
                    .unwrap();
                // Row layout: first four columns masked, last four clear.
                assert_eq!(mask[0], 1.0);
                assert_eq!(mask[3], 1.0);
                assert_eq!(mask[4], 0.0);
                assert_eq!(mask[7], 0.0);
            }
            ImageConditioning::Adm(_) => panic!("expected concat conditioning"),
        }
    }

    #[test]
    fn unclip_returns_an_embedding() {
        let model = FixtureModel {
            scheme: ConditioningScheme::UnclipAdm,
        };
        match img2img_conditioning(&model, &source(3), &latent(3), None, true, 1.0) {
            ImageConditioning::Adm(tensor) => assert_eq!(tensor.dims(), [3, 1536]),
            ImageConditioning::Concat(_) => panic!("expected adm conditioning"),
        }
    }

    #[test]
    fn flat_depth_map_normalizes_to_zeros() {
        let model = FixtureModel {
            scheme: ConditioningScheme::DepthConditioned,
        };
        match img2img_conditioning(&model, &source(1), &latent(1), None, true, 1.0) {
            ImageConditioning::Concat(tensor) => {
                assert_eq!(tensor.dims(), [1, 1, 8, 8]);
                let values = tensor.into_data().to_vec::<f32>().unwrap();
                assert!(values.iter().all(|v| *v == 0.0));
            }
            ImageConditioning::Adm(_) => panic!("expected concat conditioning"),
        }
    }

    #[test]
    fn edit_checkpoints_encode_the_source_deterministically() {
        let model = FixtureModel {
            scheme: ConditioningScheme::EditConditioned,
        };
        match img2img_conditioning(&model, &source(2), &latent(2), None, true, 1.0) {
            ImageConditioning::Concat(tensor) => assert_eq!(tensor.dims(), [2, 4, 8, 8]),
            ImageConditioning::Adm(_) => panic!("expected concat conditioning"),
        }
    }
}
