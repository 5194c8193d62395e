//! Pixel-space operations for image-to-image and inpainting preparation.
//!
//! Everything here works on plain `image` buffers and knows nothing about
//! tensors or models: mask derivation and blurring, crop-region geometry,
//! resize modes, content-aware fill of masked areas, overlay compositing
//! for pasting generated regions back into their source image, and the
//! upscaler abstraction used by the high-resolution pass.

pub mod composite;
pub mod crop;
pub mod mask;
pub mod resize;
pub mod upscale;

pub use composite::{apply_overlay, fill_masked, make_overlay};
pub use crop::{expand_crop_region, get_crop_region, CropRegion};
pub use mask::{boost_contrast, create_binary_mask, flatten, gaussian_blur_x, gaussian_blur_y, invert_mask};
pub use resize::{resize_with_mode, ResizeMode};
pub use upscale::{builtin_upscalers, ImageUpscaler, LanczosUpscaler, NearestUpscaler, NoneUpscaler};
