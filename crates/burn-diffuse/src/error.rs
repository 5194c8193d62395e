//! Error types for the generation pipeline.

use thiserror::Error;

/// Fatal conditions that abort a generation run.
///
/// Cooperative interruption is not an error; an interrupted run returns the
/// images finished so far.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("no prompt provided")]
    EmptyPrompt,

    #[error("prompt list has {found} entries, expected {expected} (batch size x iteration count)")]
    PromptCount { expected: usize, found: usize },

    #[error("batch size and iteration count must be at least 1")]
    EmptyBatch,

    #[error("width and height must be multiples of {factor}, got {width}x{height}")]
    InvalidDimensions { width: u32, height: u32, factor: usize },

    #[error("could not find upscaler named {0}")]
    UnknownUpscaler(String),

    #[error("unknown sampler: {0}")]
    UnknownSampler(String),

    #[error("image-to-image request has no source images")]
    MissingSourceImage,

    #[error("bad number of source images: {count}, expecting {batch_size} or less")]
    SourceImageCount { count: usize, batch_size: usize },

    #[error("a script hook changed the batch from {expected} images to {actual}")]
    HookCardinality { expected: usize, actual: usize },

    #[error("decoded image contains non-finite values even at full precision")]
    NonFiniteDecode,
}
