//! Per-job mutual exclusion for task variants.
//!
//! A [`VariantGuard`] is created for one job and dropped with it. In
//! sequential mode each variant must hold the guard's single permit while
//! it runs, so two variants of the same job can never overlap even if the
//! surrounding loop is later widened to run concurrently.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// One-permit semaphore scoped to a single job's lifetime.
#[derive(Debug, Clone)]
pub struct VariantGuard {
    permits: Arc<Semaphore>,
}

impl Default for VariantGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl VariantGuard {
    /// A guard with its permit available.
    #[must_use]
    pub fn new() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(1)),
        }
    }

    /// Take the permit if no other variant of this job holds it.
    #[must_use]
    pub fn try_enter(&self) -> Option<OwnedSemaphorePermit> {
        self.permits.clone().try_acquire_owned().ok()
    }

    /// Whether a variant currently holds the permit.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.permits.available_permits() == 0
    }
}
