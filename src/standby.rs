//! Process-wide safety halt.
//!
//! [`GlobalStandby`] is handed explicitly to the pipeline instead of living
//! in a module-level static. Once activated it never resets for the lifetime
//! of the process; no further job may start.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Snapshot of the standby state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StandbyState {
    pub active: bool,
    pub reason: Option<String>,
}

/// Cloneable handle to the process-wide standby flag.
///
/// # Example
///
/// ```
/// use drover::standby::GlobalStandby;
///
/// let standby = GlobalStandby::new();
/// assert!(standby.activate("account suspended"));
/// assert!(!standby.activate("second ban"));
/// assert_eq!(standby.reason().as_deref(), Some("account suspended"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct GlobalStandby {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    active: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl GlobalStandby {
    /// A fresh, inactive standby.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the halt is in effect.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Activate the halt. Returns `true` only for the call that flipped it;
    /// the first reason is kept.
    pub fn activate(&self, reason: impl Into<String>) -> bool {
        let flipped = self
            .inner
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if flipped {
            let mut slot = self.inner.reason.lock().unwrap_or_else(|e| e.into_inner());
            *slot = Some(reason.into());
        }
        flipped
    }

    /// Reason given by the activating call.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.inner
            .reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> StandbyState {
        StandbyState {
            active: self.is_active(),
            reason: self.reason(),
        }
    }
}
