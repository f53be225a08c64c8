//! Bounded log of state transitions.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::state::StateTransition;

/// Append-only transition log that evicts its oldest entries beyond a cap.
///
/// Transitions are also queued for delivery to observers. Pushes happen under
/// the state lock, so the queue holds them in the order they happened, and
/// [`TransitionLog::deliver`] hands them out in that same order.
#[derive(Debug)]
pub(crate) struct TransitionLog {
    entries: Mutex<VecDeque<StateTransition>>,
    undelivered: Mutex<VecDeque<StateTransition>>,
    delivering: Mutex<()>,
    capacity: usize,
}

impl TransitionLog {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            undelivered: Mutex::new(VecDeque::new()),
            delivering: Mutex::new(()),
            capacity,
        }
    }

    pub(crate) fn push(&self, transition: StateTransition) {
        {
            let mut entries = self.entries.lock();
            while entries.len() >= self.capacity {
                entries.pop_front();
            }
            entries.push_back(transition.clone());
        }
        self.undelivered.lock().push_back(transition);
    }

    /// All retained transitions, oldest first.
    pub(crate) fn snapshot(&self) -> Vec<StateTransition> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Hands queued transitions to `observe`, oldest first.
    ///
    /// One caller delivers at a time. A caller that finds delivery already
    /// under way returns at once and the active deliverer picks up its
    /// transitions, which also keeps an observer that triggers a transition
    /// from deadlocking on itself.
    pub(crate) fn deliver(&self, mut observe: impl FnMut(StateTransition)) {
        loop {
            let Some(guard) = self.delivering.try_lock() else {
                return;
            };

            loop {
                // The queue lock is released before `observe` runs.
                let next = self.undelivered.lock().pop_front();
                match next {
                    Some(transition) => observe(transition),
                    None => break,
                }
            }

            drop(guard);
            // A push may have landed between the last pop and the unlock.
            if self.undelivered.lock().is_empty() {
                return;
            }
        }
    }
}
