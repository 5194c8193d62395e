//! Deterministic randomness for the diffusion pipeline.
//!
//! Generation is reproducible from user-visible seeds: every image in a
//! batch gets its own seed, noise is drawn on the host from per-seed
//! generator streams and uploaded as a tensor, and variation subseeds blend
//! a second stream in at a configurable strength. Seed-resize support keeps
//! the low-frequency noise structure stable when only the output resolution
//! changes.

pub mod noise;
pub mod seeds;

pub use noise::{ImageRng, LATENT_FACTOR};
pub use seeds::{expand_seeds, expand_subseeds, resolve_seed, RANDOM_SEED, RANDOM_SEED_RANGE};
