//! Externally driven safety signals.
//!
//! The emergency chain and the cut-in-progress pulse originate in
//! hardware outside this process. Control code never caches them: every
//! state-changing entry point samples a fresh [`SafetyContext`] through
//! its [`SafetySource`] before acting, and the control loop samples once
//! per tick.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Snapshot of the safety inputs at one sampling instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SafetyContext {
    /// Emergency chain open (mushroom pressed, guard open, drive fault).
    pub emergency_active: bool,
    /// Console reports a blade cut currently in progress.
    pub cut_in_progress: bool,
}

impl SafetyContext {
    /// True when motion and new sequences are permitted.
    #[inline]
    pub fn clear(&self) -> bool {
        !self.emergency_active
    }
}

/// Provider of fresh safety samples.
///
/// Implementations must return the current hardware state on every
/// call; returning a stale snapshot breaks the one-tick emergency
/// reaction bound.
pub trait SafetySource: Send + Sync {
    fn sample(&self) -> SafetyContext;
}

/// Safety source backed by shared atomics, written by whichever context
/// polls the physical inputs (bus poller in production, tests directly).
#[derive(Debug, Clone, Default)]
pub struct AtomicSafetySource {
    emergency: Arc<AtomicBool>,
    cut_in_progress: Arc<AtomicBool>,
}

impl AtomicSafetySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writer-side handle to the emergency flag.
    pub fn emergency_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.emergency)
    }

    pub fn set_emergency(&self, active: bool) {
        self.emergency.store(active, Ordering::SeqCst);
    }

    pub fn set_cut_in_progress(&self, active: bool) {
        self.cut_in_progress.store(active, Ordering::SeqCst);
    }
}

impl SafetySource for AtomicSafetySource {
    fn sample(&self) -> SafetyContext {
        SafetyContext {
            emergency_active: self.emergency.load(Ordering::SeqCst),
            cut_in_progress: self.cut_in_progress.load(Ordering::SeqCst),
        }
    }
}
