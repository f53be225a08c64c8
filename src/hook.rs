//! Hook registry for circuit breaker events.
//!
//! Hooks run on the calling thread after the breaker has released its state
//! lock, so a hook may call back into the breaker.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::metrics::RejectionKind;
use crate::state::{CircuitState, StateTransition};

type TransitionHook = Arc<dyn Fn(&StateTransition) + Send + Sync + 'static>;
type OutcomeHook = Arc<dyn Fn() + Send + Sync + 'static>;
type RejectionHook = Arc<dyn Fn(RejectionKind) + Send + Sync + 'static>;

/// A registry for circuit breaker event hooks.
pub struct HookRegistry {
    on_open: RwLock<Option<TransitionHook>>,
    on_close: RwLock<Option<TransitionHook>>,
    on_half_open: RwLock<Option<TransitionHook>>,
    on_success: RwLock<Option<OutcomeHook>>,
    on_failure: RwLock<Option<OutcomeHook>>,
    on_rejected: RwLock<Option<RejectionHook>>,
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HookRegistry {
    /// Creates a new empty hook registry.
    pub fn new() -> Self {
        Self {
            on_open: RwLock::new(None),
            on_close: RwLock::new(None),
            on_half_open: RwLock::new(None),
            on_success: RwLock::new(None),
            on_failure: RwLock::new(None),
            on_rejected: RwLock::new(None),
        }
    }

    /// Sets the hook to call when the circuit breaker opens.
    pub fn set_on_open<F>(&self, f: F)
    where
        F: Fn(&StateTransition) + Send + Sync + 'static,
    {
        *self.on_open.write() = Some(Arc::new(f));
    }

    /// Sets the hook to call when the circuit breaker closes.
    pub fn set_on_close<F>(&self, f: F)
    where
        F: Fn(&StateTransition) + Send + Sync + 'static,
    {
        *self.on_close.write() = Some(Arc::new(f));
    }

    /// Sets the hook to call when the circuit breaker half-opens.
    pub fn set_on_half_open<F>(&self, f: F)
    where
        F: Fn(&StateTransition) + Send + Sync + 'static,
    {
        *self.on_half_open.write() = Some(Arc::new(f));
    }

    /// Sets the hook to call when a dispatched call succeeds.
    pub fn set_on_success<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.on_success.write() = Some(Arc::new(f));
    }

    /// Sets the hook to call when a dispatched call fails or times out.
    pub fn set_on_failure<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.on_failure.write() = Some(Arc::new(f));
    }

    /// Sets the hook to call when the breaker refuses a call.
    pub fn set_on_rejected<F>(&self, f: F)
    where
        F: Fn(RejectionKind) + Send + Sync + 'static,
    {
        *self.on_rejected.write() = Some(Arc::new(f));
    }

    /// Executes the appropriate hook for a state transition.
    pub(crate) fn execute_state_transition_hook(&self, transition: &StateTransition) {
        let slot = match transition.to {
            CircuitState::Open => &self.on_open,
            CircuitState::Closed => &self.on_close,
            CircuitState::HalfOpen => &self.on_half_open,
        };
        // The slot lock is never held while user code runs.
        let hook = slot.read().clone();
        if let Some(hook) = hook {
            hook(transition);
        }
    }

    pub(crate) fn execute_success_hook(&self) {
        let hook = self.on_success.read().clone();
        if let Some(hook) = hook {
            hook();
        }
    }

    pub(crate) fn execute_failure_hook(&self) {
        let hook = self.on_failure.read().clone();
        if let Some(hook) = hook {
            hook();
        }
    }

    pub(crate) fn execute_rejection_hook(&self, kind: RejectionKind) {
        let hook = self.on_rejected.read().clone();
        if let Some(hook) = hook {
            hook(kind);
        }
    }
}
