//! Concurrency control for pipeline invocations.
//!
//! Each submitted batch fans out into one pipeline invocation per partition
//! (local files, plus one per drive account). The scheduler caps how many
//! invocations stream concurrently so a large multi-account batch cannot
//! saturate the processing service.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Caps concurrent pipeline invocations.
///
/// Permits release automatically on drop, so a partition that ends in a
/// transport error still frees its slot.
#[derive(Clone)]
pub struct PipelineScheduler {
    sem: Arc<Semaphore>,
    max: usize,
}

impl PipelineScheduler {
    /// Creates a scheduler allowing `max_concurrent` invocations at once.
    ///
    /// # Panics
    ///
    /// Panics if `max_concurrent` is 0.
    pub fn new(max_concurrent: usize) -> Self {
        assert!(max_concurrent > 0, "max_concurrent must be greater than 0");

        Self {
            sem: Arc::new(Semaphore::new(max_concurrent)),
            max: max_concurrent,
        }
    }

    /// Acquires a slot, waiting if all are in use.
    pub async fn acquire(&self) -> PipelinePermit {
        // The semaphore is never closed, so acquire_owned cannot fail
        let permit = self
            .sem
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore closed unexpectedly");

        PipelinePermit { _permit: permit }
    }

    /// Returns the number of invocations currently holding a slot.
    pub fn active_invocations(&self) -> usize {
        self.max - self.sem.available_permits()
    }

    /// Returns the number of free slots.
    pub fn available_slots(&self) -> usize {
        self.sem.available_permits()
    }
}

/// An active invocation slot; dropped to release.
pub struct PipelinePermit {
    _permit: OwnedSemaphorePermit,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
