//! Shared job state for cooperative interruption and progress tracking.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Cheaply clonable handle onto a running generation job.
///
/// The generation loop polls it between iterations; any other holder of a
/// clone may request an interrupt or a skip at any time. Interrupt aborts
/// the whole run (keeping finished images), skip discards only the
/// iteration currently in flight.
#[derive(Clone, Default)]
pub struct JobState {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    interrupted: AtomicBool,
    skipped: AtomicBool,
    job_count: AtomicUsize,
    job_no: AtomicUsize,
    job_count_refined: AtomicBool,
    job: Mutex<String>,
}

impl JobState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests that the run stop at the next iteration boundary.
    pub fn interrupt(&self) {
        self.inner.interrupted.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.inner.interrupted.load(Ordering::SeqCst)
    }

    /// Requests that the current iteration be discarded.
    pub fn skip(&self) {
        self.inner.skipped.store(true, Ordering::SeqCst);
    }

    /// Reads and clears the skip flag.
    pub fn take_skip(&self) -> bool {
        self.inner.skipped.swap(false, Ordering::SeqCst)
    }

    /// Resets flags and counters at the start of a run.
    pub fn begin(&self, job_count: usize) {
        self.inner.interrupted.store(false, Ordering::SeqCst);
        self.inner.skipped.store(false, Ordering::SeqCst);
        self.inner.job_count.store(job_count, Ordering::SeqCst);
        self.inner.job_no.store(0, Ordering::SeqCst);
        self.inner.job_count_refined.store(false, Ordering::SeqCst);
    }

    /// Multiplies the job count once per run; the high-resolution pass uses
    /// this to account for its second round of sampling jobs.
    pub fn refine_job_count(&self, factor: usize) {
        if !self.inner.job_count_refined.swap(true, Ordering::SeqCst) {
            let count = self.inner.job_count.load(Ordering::SeqCst);
            self.inner.job_count.store(count * factor, Ordering::SeqCst);
        }
    }

    pub fn job_count(&self) -> usize {
        self.inner.job_count.load(Ordering::SeqCst)
    }

    /// Marks one job finished.
    pub fn next_job(&self) {
        self.inner.job_no.fetch_add(1, Ordering::SeqCst);
    }

    pub fn job_no(&self) -> usize {
        self.inner.job_no.load(Ordering::SeqCst)
    }

    /// Sets the human-readable label for the job in progress.
    pub fn set_job(&self, label: impl Into<String>) {
        let label = label.into();
        match self.inner.job.lock() {
            Ok(mut guard) => *guard = label,
            Err(poisoned) => *poisoned.into_inner() = label,
        }
    }

    pub fn job(&self) -> String {
        match self.inner.job.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_flags() {
        let state = JobState::new();
        let other = state.clone();
        other.interrupt();
        assert!(state.is_interrupted());
    }

    #[test]
    fn skip_clears_on_read() {
        let state = JobState::new();
        state.skip();
        assert!(state.take_skip());
        assert!(!state.take_skip());
    }

    #[test]
    fn job_count_refines_only_once() {
        let state = JobState::new();
        state.begin(3);
        state.refine_job_count(2);
        state.refine_job_count(2);
        assert_eq!(state.job_count(), 6);
    }

    #[test]
    fn begin_resets_previous_run() {
        let state = JobState::new();
        state.interrupt();
        state.skip();
        state.begin(1);
        assert!(!state.is_interrupted());
        assert!(!state.take_skip());
        assert_eq!(state.job_no(), 0);
    }
}
