//! Extension hooks.
//!
//! Hooks observe and adjust a run at fixed points: before setup, before
//! and after each batch, per finished image, and once on the assembled
//! result. They run in registration order. Hooks may edit images in place
//! but must not change how many there are; the pipeline verifies the
//! count after each batch-level hook and fails the run on a mismatch.

use burn::tensor::backend::Backend;
use image::RgbImage;

use crate::request::GenerationRequest;
use crate::result::Processed;

/// Read-only view of the slice of work for one iteration.
#[derive(Debug, Clone)]
pub struct IterationState {
    pub iteration: usize,
    pub prompts: Vec<String>,
    pub negative_prompts: Vec<String>,
    pub seeds: Vec<i64>,
    pub subseeds: Vec<i64>,
}

/// Callbacks invoked at fixed points of a run. Every method defaults to a
/// no-op; implement the ones you need.
#[allow(unused_variables)]
pub trait ScriptHooks<B: Backend> {
    /// Before any setup; may still rewrite dimensions, seeds, prompts.
    fn before_process(&mut self, p: &mut GenerationRequest<B>) {}

    /// After seeds and prompts are resolved, before the first batch.
    fn process(&mut self, p: &mut GenerationRequest<B>) {}

    /// Before conditioning is computed for a batch.
    fn before_process_batch(&mut self, p: &mut GenerationRequest<B>, batch: &IterationState) {}

    /// After conditioning, immediately before sampling.
    fn process_batch(&mut self, p: &mut GenerationRequest<B>, batch: &IterationState) {}

    /// Before the high-resolution pass samples.
    fn before_hr(&mut self, p: &mut GenerationRequest<B>) {}

    /// After a batch is decoded to images.
    fn postprocess_batch(
        &mut self,
        p: &mut GenerationRequest<B>,
        images: &mut Vec<RgbImage>,
        batch_number: usize,
    ) {
    }

    /// Second look at the decoded batch, after every hook's
    /// [`postprocess_batch`](Self::postprocess_batch) ran.
    fn postprocess_batch_list(
        &mut self,
        p: &mut GenerationRequest<B>,
        images: &mut Vec<RgbImage>,
        batch_number: usize,
    ) {
    }

    /// Per image, after overlays and pasting.
    fn postprocess_image(
        &mut self,
        p: &mut GenerationRequest<B>,
        image: &mut RgbImage,
        index: usize,
    ) {
    }

    /// Once, on the assembled result.
    fn postprocess(&mut self, p: &mut GenerationRequest<B>, result: &mut Processed) {}
}

/// Ordered collection of hooks.
pub struct ScriptRunner<B: Backend> {
    scripts: Vec<Box<dyn ScriptHooks<B>>>,
}

impl<B: Backend> Default for ScriptRunner<B> {
    fn default() -> Self {
        Self {
            scripts: Vec::new(),
        }
    }
}

impl<B: Backend> ScriptRunner<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, script: Box<dyn ScriptHooks<B>>) {
        self.scripts.push(script);
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }

    pub fn before_process(&mut self, p: &mut GenerationRequest<B>) {
        for script in &mut self.scripts {
            script.before_process(p);
        }
    }

    pub fn process(&mut self, p: &mut GenerationRequest<B>) {
        for script in &mut self.scripts {
            script.process(p);
        }
    }

    pub fn before_process_batch(&mut self, p: &mut GenerationRequest<B>, batch: &IterationState) {
        for script in &mut self.scripts {
            script.before_process_batch(p, batch);
        }
    }

    pub fn process_batch(&mut self, p: &mut GenerationRequest<B>, batch: &IterationState) {
        for script in &mut self.scripts {
            script.process_batch(p, batch);
        }
    }

    pub fn before_hr(&mut self, p: &mut GenerationRequest<B>) {
        for script in &mut self.scripts {
            script.before_hr(p);
        }
    }

    pub fn postprocess_batch(
        &mut self,
        p: &mut GenerationRequest<B>,
        images: &mut Vec<RgbImage>,
        batch_number: usize,
    ) {
        for script in &mut self.scripts {
            script.postprocess_batch(p, images, batch_number);
        }
    }

    pub fn postprocess_batch_list(
        &mut self,
        p: &mut GenerationRequest<B>,
        images: &mut Vec<RgbImage>,
        batch_number: usize,
    ) {
        for script in &mut self.scripts {
            script.postprocess_batch_list(p, images, batch_number);
        }
    }

    pub fn postprocess_image(
        &mut self,
        p: &mut GenerationRequest<B>,
        image: &mut RgbImage,
        index: usize,
    ) {
        for script in &mut self.scripts {
            script.postprocess_image(p, image, index);
        }
    }

    pub fn postprocess(&mut self, p: &mut GenerationRequest<B>, result: &mut Processed) {
        for script in &mut self.scripts {
            script.postprocess(p, result);
        }
    }
}
