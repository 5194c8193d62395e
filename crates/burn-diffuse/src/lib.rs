//! Orchestration for text-conditioned latent diffusion.
//!
//! This crate runs the batch loop around a diffusion model: prompt and
//! seed bookkeeping, conditioning caching, text-to-image and
//! image-to-image requests (including inpainting), the high-resolution
//! second pass, and assembly of results with reproduction metadata. The
//! model itself stays behind the [`DiffusionBackend`] trait; the crate
//! only moves tensors between its methods.
//!
//! # Usage
//!
//! ```ignore
//! use burn_diffuse::{GenerationRequest, GenerationRuntime};
//!
//! let mut runtime = GenerationRuntime::new(model);
//!
//! let mut request = GenerationRequest::text2image();
//! request.prompt = "a watercolor fox".into();
//! request.seed = 42;
//! request.batch_size = 2;
//!
//! let result = runtime.process_images(&mut request)?;
//! for (image, info) in result.images.iter().zip(&result.infotexts) {
//!     println!("{info}");
//! }
//! ```
//!
//! Image-to-image works the same way through
//! [`GenerationRequest::image2image`]; masks, resize behavior and
//! inpainting options live in [`Image2ImageParams`], the high-resolution
//! pass in [`Text2ImageParams`].

pub mod backend;
pub mod conds;
pub mod error;
pub mod hires;
pub mod image_conditioning;
pub mod img2img;
pub mod infotext;
pub mod latent;
pub mod networks;
pub mod options;
pub mod process;
pub mod request;
pub mod result;
pub mod scripts;
pub mod state;

pub use backend::{
    default_samplers, CheckpointInfo, Conditioning, DecodePrecision, DiffusionBackend,
    SampleParams, SamplerInfo,
};
pub use conds::{CondCache, CondCaches, CondKey};
pub use error::ProcessError;
pub use image_conditioning::{ConditioningScheme, ImageConditioning};
pub use networks::{ExtraNetworkData, ExtraNetworkParams};
pub use options::{Options, PromptStyle};
pub use process::GenerationRuntime;
pub use request::{
    GenerationRequest, Image2ImageParams, InpaintFill, Prompts, RequestKind, Text2ImageParams,
};
pub use result::Processed;
pub use scripts::{IterationState, ScriptHooks, ScriptRunner};
pub use state::JobState;
