//! # Observation Gate
//!
//! Single-owner mutex breaking the echo cycle between the two translation
//! directions: while the binding mutates one side, the observer for that
//! side must not translate the change back.
//!
//! Semantics: `enter` succeeds exactly when the gate is not held; a failed
//! entry means the work is dropped, never queued. The guard releases on all
//! exit paths.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Per-binding re-entrancy gate.
#[derive(Clone, Default)]
pub struct ObservationGate(Arc<AtomicBool>);

/// Holds the gate until dropped.
pub struct GateGuard(Arc<AtomicBool>);

impl ObservationGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the gate. Returns `None` when it is already held; nested
    /// acquisition is a silent no-op for the caller to treat as correct.
    pub fn enter(&self) -> Option<GateGuard> {
        if self
            .0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Some(GateGuard(Arc::clone(&self.0)))
        } else {
            None
        }
    }

    pub fn is_held(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
