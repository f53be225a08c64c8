//! Circuit breaker state machine implementation.
//!
//! ```text
//! Closed   --failure threshold reached------> Open
//! Open     --open timeout elapsed, probe-----> HalfOpen
//! HalfOpen --success threshold reached-------> Closed
//! HalfOpen --any probe failure---------------> Open
//! ```
//!
//! All mutation goes through one mutex. The current state and the instant it
//! was entered are mirrored into atomics so readers never wait on it.

use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use atomic::Atomic;
use parking_lot::Mutex;

use crate::config::BreakerConfig;
use crate::error::InternalError;
use crate::history::TransitionLog;
use crate::policy::FailurePolicy;

/// Represents the possible states of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CircuitState {
    /// Circuit is closed and operations are allowed.
    Closed = 0,

    /// Circuit is open and operations are rejected.
    Open = 1,

    /// Circuit is allowing a limited number of probes to test recovery.
    HalfOpen = 2,
}

impl CircuitState {
    /// Lower-case name used in logs and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

impl Display for CircuitState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a state transition happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionReason {
    /// Enough failures were counted while closed.
    FailureThresholdReached {
        /// Failures counted when the circuit tripped.
        failures: u32,
    },
    /// The open timeout elapsed and a probe was admitted.
    OpenTimeoutElapsed,
    /// Enough consecutive probes succeeded.
    ProbesSucceeded {
        /// Consecutive successful probes.
        successes: u32,
    },
    /// A probe failed while half-open.
    ProbeFailed,
    /// An operator forced the state.
    Forced(String),
}

impl Display for TransitionReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TransitionReason::FailureThresholdReached { failures } => {
                write!(f, "failure threshold reached ({failures} failures)")
            }
            TransitionReason::OpenTimeoutElapsed => write!(f, "open timeout elapsed"),
            TransitionReason::ProbesSucceeded { successes } => {
                write!(f, "{successes} consecutive probes succeeded")
            }
            TransitionReason::ProbeFailed => write!(f, "probe failed"),
            TransitionReason::Forced(reason) => write!(f, "forced: {reason}"),
        }
    }
}

/// A single state change, as recorded in the transition log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransition {
    /// State before the change.
    pub from: CircuitState,
    /// State after the change.
    pub to: CircuitState,
    /// What caused the change.
    pub reason: TransitionReason,
    /// When the change happened, on the breaker's clock.
    pub at: Instant,
}

/// The mutable record behind a breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerStateData {
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures while closed.
    pub consecutive_failures: u32,
    /// Consecutive successful probes while half-open.
    pub consecutive_successes: u32,
    /// When the current state was entered.
    pub last_state_change_at: Instant,
    /// When the last failure was recorded.
    pub last_failure_at: Option<Instant>,
    /// Probes admitted and not yet completed while half-open.
    pub half_open_in_flight: u32,
    /// Incremented on every transition.
    pub generation: u64,
}

impl BreakerStateData {
    fn new(now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_state_change_at: now,
            last_failure_at: None,
            half_open_in_flight: 0,
            generation: 0,
        }
    }
}

/// Admission ticket for one call.
///
/// Outcomes are only applied to the state machine when the permit's generation
/// still matches; a call admitted before a transition reports into the void.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Permit {
    pub(crate) probe: bool,
    pub(crate) generation: u64,
}

/// Why [`StateManager::can_proceed`] refused a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Rejection {
    CircuitOpen { retry_after: Duration },
    ProbeLimitExceeded { in_flight: u32, limit: u32 },
    Internal(InternalError),
}

/// What applying an outcome did to the state machine.
#[derive(Debug)]
pub(crate) struct Recorded {
    pub(crate) transition: Option<StateTransition>,
    /// Set when the permit predates the current generation and the outcome
    /// was not applied.
    pub(crate) stale: Option<Stale>,
}

/// Generations of a permit that arrived after the state moved on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Stale {
    pub(crate) admitted: u64,
    pub(crate) current: u64,
}

impl Recorded {
    fn applied(transition: Option<StateTransition>) -> Self {
        Self {
            transition,
            stale: None,
        }
    }

    fn check(permit: Permit, current: u64) -> Option<Self> {
        (permit.generation != current).then_some(Self {
            transition: None,
            stale: Some(Stale {
                admitted: permit.generation,
                current,
            }),
        })
    }
}

/// Result of an admission check, plus the transition it caused if any.
#[derive(Debug)]
pub(crate) struct Admission {
    pub(crate) result: Result<Permit, Rejection>,
    pub(crate) transition: Option<StateTransition>,
}

struct Inner {
    data: BreakerStateData,
    policy: FailurePolicy,
}

/// Owns the breaker's state and applies the transition rules.
pub(crate) struct StateManager {
    inner: Mutex<Inner>,
    success_threshold: u32,
    open_timeout: Duration,
    max_probes: u32,
    history: TransitionLog,
    state: Atomic<CircuitState>,
    origin: Instant,
    entered_at_nanos: AtomicU64,
}

impl StateManager {
    /// Creates a closed state manager.
    pub(crate) fn new(config: &BreakerConfig, now: Instant) -> Self {
        Self {
            inner: Mutex::new(Inner {
                data: BreakerStateData::new(now),
                policy: FailurePolicy::new(config.failure_counting(), config.failure_threshold()),
            }),
            success_threshold: config.success_threshold(),
            open_timeout: config.open_timeout(),
            max_probes: config.half_open_max_concurrent_probes(),
            history: TransitionLog::new(config.history_capacity()),
            state: Atomic::new(CircuitState::Closed),
            origin: now,
            entered_at_nanos: AtomicU64::new(0),
        }
    }

    /// Gets the current state without taking the lock.
    pub(crate) fn current(&self) -> CircuitState {
        self.state.load(Ordering::Acquire)
    }

    /// When the current state was entered, without taking the lock.
    pub(crate) fn entered_at(&self) -> Instant {
        self.origin + Duration::from_nanos(self.entered_at_nanos.load(Ordering::Acquire))
    }

    /// Copy of the state record.
    pub(crate) fn data(&self) -> BreakerStateData {
        self.inner.lock().data.clone()
    }

    /// Retained transitions, oldest first.
    pub(crate) fn history(&self) -> Vec<StateTransition> {
        self.history.snapshot()
    }

    /// Decides whether a call may run now.
    ///
    /// The first call after the open timeout moves the circuit to half-open
    /// and becomes its first probe; concurrent callers serialize on the lock,
    /// so exactly one of them wins that transition.
    pub(crate) fn can_proceed(&self, now: Instant) -> Admission {
        let mut inner = self.inner.lock();
        let generation = inner.data.generation;

        match inner.data.state {
            CircuitState::Closed => Admission {
                result: Ok(Permit {
                    probe: false,
                    generation,
                }),
                transition: None,
            },
            CircuitState::Open => {
                let Some(elapsed) = now.checked_duration_since(inner.data.last_state_change_at)
                else {
                    return Admission {
                        result: Err(Rejection::Internal(InternalError::ClockWentBackwards)),
                        transition: None,
                    };
                };

                if elapsed < self.open_timeout {
                    return Admission {
                        result: Err(Rejection::CircuitOpen {
                            retry_after: self.open_timeout - elapsed,
                        }),
                        transition: None,
                    };
                }

                let transition = self.transition(
                    &mut inner,
                    CircuitState::HalfOpen,
                    TransitionReason::OpenTimeoutElapsed,
                    now,
                );
                inner.data.half_open_in_flight = 1;
                Admission {
                    result: Ok(Permit {
                        probe: true,
                        generation: inner.data.generation,
                    }),
                    transition: Some(transition),
                }
            }
            CircuitState::HalfOpen => {
                let in_flight = inner.data.half_open_in_flight;
                if in_flight >= self.max_probes {
                    return Admission {
                        result: Err(Rejection::ProbeLimitExceeded {
                            in_flight,
                            limit: self.max_probes,
                        }),
                        transition: None,
                    };
                }

                inner.data.half_open_in_flight = in_flight + 1;
                Admission {
                    result: Ok(Permit {
                        probe: true,
                        generation,
                    }),
                    transition: None,
                }
            }
        }
    }

    /// Applies a successful outcome.
    pub(crate) fn record_success(&self, permit: Permit, now: Instant) -> Recorded {
        let mut inner = self.inner.lock();
        Self::release_slot(&mut inner, permit);
        if let Some(stale) = Recorded::check(permit, inner.data.generation) {
            return stale;
        }

        let transition = match inner.data.state {
            CircuitState::Closed => {
                inner.data.consecutive_failures = 0;
                None
            }
            // A current-generation permit is never issued while open, but if one
            // reports here it is handled like a probe.
            CircuitState::HalfOpen | CircuitState::Open => {
                inner.data.consecutive_successes += 1;
                let successes = inner.data.consecutive_successes;
                (successes >= self.success_threshold).then(|| {
                    self.transition(
                        &mut inner,
                        CircuitState::Closed,
                        TransitionReason::ProbesSucceeded { successes },
                        now,
                    )
                })
            }
        };
        Recorded::applied(transition)
    }

    /// Applies a failed outcome.
    pub(crate) fn record_failure(&self, permit: Permit, now: Instant) -> Recorded {
        let mut inner = self.inner.lock();
        Self::release_slot(&mut inner, permit);
        inner.data.last_failure_at = Some(now);
        if let Some(stale) = Recorded::check(permit, inner.data.generation) {
            return stale;
        }

        let transition = match inner.data.state {
            CircuitState::Closed => {
                inner.data.consecutive_failures = inner.data.consecutive_failures.saturating_add(1);
                let consecutive = inner.data.consecutive_failures;
                inner
                    .policy
                    .record_failure(consecutive, now)
                    .map(|failures| {
                        self.transition(
                            &mut inner,
                            CircuitState::Open,
                            TransitionReason::FailureThresholdReached { failures },
                            now,
                        )
                    })
            }
            CircuitState::HalfOpen => Some(self.transition(
                &mut inner,
                CircuitState::Open,
                TransitionReason::ProbeFailed,
                now,
            )),
            CircuitState::Open => None,
        };
        Recorded::applied(transition)
    }

    /// Gives back a probe slot without recording an outcome.
    pub(crate) fn release(&self, permit: Permit) {
        let mut inner = self.inner.lock();
        Self::release_slot(&mut inner, permit);
    }

    /// Moves to `to` regardless of the current state.
    pub(crate) fn force_state(
        &self,
        to: CircuitState,
        reason: String,
        now: Instant,
    ) -> StateTransition {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, to, TransitionReason::Forced(reason), now)
    }

    /// Moves to `to` unless the circuit is already there.
    pub(crate) fn force_state_if_changed(
        &self,
        to: CircuitState,
        reason: String,
        now: Instant,
    ) -> Option<StateTransition> {
        let mut inner = self.inner.lock();
        if inner.data.state == to {
            return None;
        }
        Some(self.transition(&mut inner, to, TransitionReason::Forced(reason), now))
    }

    /// Hands transitions not yet observed to `observe`, in the order they
    /// happened. Must be called without holding the state lock.
    pub(crate) fn deliver_transitions(&self, observe: impl FnMut(StateTransition)) {
        self.history.deliver(observe);
    }

    fn release_slot(inner: &mut Inner, permit: Permit) {
        if permit.probe
            && permit.generation == inner.data.generation
            && inner.data.state == CircuitState::HalfOpen
        {
            inner.data.half_open_in_flight = inner.data.half_open_in_flight.saturating_sub(1);
        }
    }

    fn transition(
        &self,
        inner: &mut Inner,
        to: CircuitState,
        reason: TransitionReason,
        now: Instant,
    ) -> StateTransition {
        let data = &mut inner.data;
        let from = data.state;

        data.state = to;
        data.last_state_change_at = now;
        data.consecutive_failures = 0;
        data.consecutive_successes = 0;
        data.half_open_in_flight = 0;
        data.generation = data.generation.wrapping_add(1);
        inner.policy.reset();

        let nanos = now.saturating_duration_since(self.origin).as_nanos();
        self.entered_at_nanos
            .store(u64::try_from(nanos).unwrap_or(u64::MAX), Ordering::Release);
        self.state.store(to, Ordering::Release);

        let transition = StateTransition {
            from,
            to,
            reason,
            at: now,
        };
        self.history.push(transition.clone());
        transition
    }
}
