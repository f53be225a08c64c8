//! Trip policy: how failures are counted while the circuit is closed.

use smallvec::SmallVec;
use std::time::{Duration, Instant};

/// How closed-state failures are counted against the failure threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCounting {
    /// Any success resets the count.
    Consecutive,
    /// Failures inside the trailing window are counted, successes don't reset.
    RollingWindow(Duration),
}

/// Tracks closed-state failures and decides when the circuit trips.
#[derive(Debug, Clone)]
pub(crate) struct FailurePolicy {
    counting: FailureCounting,
    threshold: u32,
    // Timestamps of failures still inside the rolling window, oldest first.
    recent: SmallVec<[Instant; 16]>,
}

impl FailurePolicy {
    pub(crate) fn new(counting: FailureCounting, threshold: u32) -> Self {
        Self {
            counting,
            threshold,
            recent: SmallVec::new(),
        }
    }

    /// Registers a failure. Returns the counted failures once the threshold
    /// is reached, `None` while the circuit should stay closed.
    ///
    /// `consecutive` is the consecutive failure count including this failure.
    pub(crate) fn record_failure(&mut self, consecutive: u32, now: Instant) -> Option<u32> {
        let counted = match self.counting {
            FailureCounting::Consecutive => consecutive,
            FailureCounting::RollingWindow(window) => {
                self.evict(now, window);
                self.recent.push(now);
                u32::try_from(self.recent.len()).unwrap_or(u32::MAX)
            }
        };
        (counted >= self.threshold).then_some(counted)
    }

    /// Forgets every failure, used whenever the circuit changes state.
    pub(crate) fn reset(&mut self) {
        self.recent.clear();
    }

    fn evict(&mut self, now: Instant, window: Duration) {
        let Some(cutoff) = now.checked_sub(window) else {
            return;
        };
        let expired = self.recent.iter().take_while(|at| **at <= cutoff).count();
        if expired > 0 {
            self.recent.drain(..expired);
        }
    }
}
