//! Core circuit breaker implementation.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::clock::{Clock, MonotonicClock};
use crate::config::{BreakerBuilder, BreakerConfig};
use crate::error::{BreakerError, BreakerResult};
use crate::hook::HookRegistry;
use crate::metrics::{
    BreakerCounters, CallOutcome, MetricSink, MetricsSnapshot, NullMetricSink, RejectionKind,
};
use crate::state::{
    BreakerStateData, CircuitState, Permit, Recorded, Rejection, StateManager, StateTransition,
};

/// Name given to breakers built without one.
pub const DEFAULT_BREAKER_NAME: &str = "default";

/// State shared by every handle to one breaker.
struct BreakerInner {
    name: String,
    config: BreakerConfig,
    state_manager: StateManager,
    counters: BreakerCounters,
    clock: Arc<dyn Clock>,
    metric_sink: Arc<dyn MetricSink>,
    hooks: Arc<HookRegistry>,
}

/// A circuit breaker guarding calls to one downstream dependency.
///
/// Cloning is cheap and yields another handle to the same breaker. Give each
/// dependency its own breaker; they never share state.
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<BreakerInner>,
}

impl CircuitBreaker {
    /// Creates a circuit breaker on the system monotonic clock.
    pub fn new(config: BreakerConfig) -> Self {
        Self::with_clock(config, MonotonicClock)
    }

    /// Creates a circuit breaker reading time from `clock`.
    pub fn with_clock<C: Clock>(config: BreakerConfig, clock: C) -> Self {
        Self::from_parts(
            DEFAULT_BREAKER_NAME.to_owned(),
            config,
            Arc::new(clock),
            Arc::new(NullMetricSink),
            Arc::new(HookRegistry::new()),
        )
    }

    pub(crate) fn from_parts(
        name: String,
        config: BreakerConfig,
        clock: Arc<dyn Clock>,
        metric_sink: Arc<dyn MetricSink>,
        hooks: Arc<HookRegistry>,
    ) -> Self {
        let state_manager = StateManager::new(&config, clock.now());
        let inner = BreakerInner {
            name,
            config,
            state_manager,
            counters: BreakerCounters::default(),
            clock,
            metric_sink,
            hooks,
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Creates a new builder for customizing a circuit breaker.
    pub fn builder() -> BreakerBuilder {
        BreakerBuilder::new()
    }

    /// Name used in logs.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The breaker's configuration.
    pub fn config(&self) -> &BreakerConfig {
        &self.inner.config
    }

    /// Gets the current state of the circuit breaker.
    pub fn current_state(&self) -> CircuitState {
        self.inner.state_manager.current()
    }

    /// Copy of the breaker's state record.
    pub fn state_data(&self) -> BreakerStateData {
        self.inner.state_manager.data()
    }

    /// Point-in-time metrics. Never blocks on the state lock.
    pub fn metrics(&self) -> MetricsSnapshot {
        let state = self.inner.state_manager.current();
        let entered_at = self.inner.state_manager.entered_at();
        let time_in_state = self.inner.clock.now().saturating_duration_since(entered_at);
        self.inner.counters.snapshot(state, time_in_state)
    }

    /// Retained state transitions, oldest first.
    pub fn state_history(&self) -> Vec<StateTransition> {
        self.inner.state_manager.history()
    }

    /// Executes a function wrapped by the circuit breaker.
    ///
    /// A rejected call never runs `f`. An `Err` from `f` is counted as a
    /// failure and handed back unchanged in [`BreakerError::Operation`]. With a
    /// call timeout configured, a call that ran too long is counted as a
    /// failure and its result dropped. A panic in `f` is counted as a failure
    /// and then continues to unwind.
    pub fn call<F, T, E>(&self, f: F) -> BreakerResult<T, E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let guard = self.pre_call::<E>()?;
        let result = f();
        let elapsed = guard.elapsed();

        match self.inner.config.call_timeout() {
            Some(limit) if elapsed > limit => guard.timed_out(elapsed, limit),
            _ => guard.complete(result, elapsed),
        }
    }

    /// Moves the breaker to `state` regardless of the transition rules.
    ///
    /// Meant for operational tooling. A transition is always recorded, even
    /// when the breaker is already in `state`.
    pub fn force_state(&self, state: CircuitState, reason: impl Into<String>) -> StateTransition {
        let now = self.inner.clock.now();
        let transition = self
            .inner
            .state_manager
            .force_state(state, reason.into(), now);
        self.inner.publish_transitions();
        transition
    }

    /// Forces the circuit breaker to the open state.
    ///
    /// Returns `false` when it was already open. Of several concurrent
    /// callers, only the one that moved the circuit gets `true`.
    pub fn force_open(&self) -> bool {
        self.force_if_changed(CircuitState::Open, "forced open")
    }

    /// Forces the circuit breaker to the closed state.
    ///
    /// Returns `false` when it was already closed.
    pub fn force_closed(&self) -> bool {
        self.force_if_changed(CircuitState::Closed, "forced closed")
    }

    fn force_if_changed(&self, state: CircuitState, reason: &str) -> bool {
        let now = self.inner.clock.now();
        let changed = self
            .inner
            .state_manager
            .force_state_if_changed(state, reason.to_owned(), now)
            .is_some();
        self.inner.publish_transitions();
        changed
    }

    /// Checks if a call is allowed based on the current state.
    fn pre_call<E>(&self) -> Result<CallGuard<'_>, BreakerError<E>> {
        let now = self.inner.clock.now();
        let admission = self.inner.state_manager.can_proceed(now);

        if admission.transition.is_some() {
            self.inner.publish_transitions();
        }

        match admission.result {
            Ok(permit) => Ok(CallGuard {
                breaker: &self.inner,
                permit: Some(permit),
                started_at: now,
            }),
            Err(rejection) => Err(self.inner.reject(rejection)),
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.inner.name)
            .field("state", &self.current_state())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl BreakerInner {
    /// Publishes pending transitions in the order they happened.
    fn publish_transitions(&self) {
        self.state_manager
            .deliver_transitions(|transition| self.announce(&transition));
    }

    /// Publishes a transition to logs, the metric sink and hooks.
    fn announce(&self, transition: &StateTransition) {
        match transition.to {
            CircuitState::Open => warn!(
                breaker = %self.name,
                from = %transition.from,
                reason = %transition.reason,
                "circuit breaker opened"
            ),
            CircuitState::HalfOpen => info!(
                breaker = %self.name,
                from = %transition.from,
                reason = %transition.reason,
                "circuit breaker half-open, probing dependency"
            ),
            CircuitState::Closed => info!(
                breaker = %self.name,
                from = %transition.from,
                reason = %transition.reason,
                "circuit breaker closed"
            ),
        }

        self.metric_sink.record_state_transition(transition);
        self.hooks.execute_state_transition_hook(transition);
    }

    fn reject<E>(&self, rejection: Rejection) -> BreakerError<E> {
        let (kind, err) = match rejection {
            Rejection::CircuitOpen { retry_after } => {
                debug!(breaker = %self.name, ?retry_after, "call short-circuited, circuit open");
                (
                    RejectionKind::CircuitOpen,
                    BreakerError::CircuitOpen {
                        state: CircuitState::Open,
                        retry_after,
                    },
                )
            }
            Rejection::ProbeLimitExceeded { in_flight, limit } => {
                debug!(breaker = %self.name, in_flight, limit, "call rejected, probe limit reached");
                (
                    RejectionKind::ProbeLimitExceeded,
                    BreakerError::ProbeLimitExceeded { in_flight, limit },
                )
            }
            Rejection::Internal(internal) => {
                error!(breaker = %self.name, error = %internal, "circuit breaker defect, rejecting call");
                (RejectionKind::Internal, BreakerError::Internal(internal))
            }
        };

        self.counters.record_rejection(kind);
        self.metric_sink.record_rejection(kind);
        self.hooks.execute_rejection_hook(kind);
        err
    }

    fn record_outcome(&self, permit: Permit, outcome: CallOutcome, duration: Duration) {
        let now = self.clock.now();
        let Recorded { transition, stale } = match outcome {
            CallOutcome::Success => self.state_manager.record_success(permit, now),
            CallOutcome::Failure | CallOutcome::Timeout => {
                self.state_manager.record_failure(permit, now)
            }
        };
        if let Some(stale) = stale {
            debug!(
                breaker = %self.name,
                outcome = outcome.as_str(),
                admitted_generation = stale.admitted,
                current_generation = stale.current,
                "ignoring outcome of call admitted before the last transition"
            );
        }

        self.counters.record_call(outcome);
        self.metric_sink.record_call(outcome, duration);
        match outcome {
            CallOutcome::Success => self.hooks.execute_success_hook(),
            CallOutcome::Failure | CallOutcome::Timeout => self.hooks.execute_failure_hook(),
        }

        if transition.is_some() {
            self.publish_transitions();
        }
    }
}

/// An admitted call whose outcome has not been reported yet.
///
/// Dropping the guard without reporting covers the two ways a call can end
/// early: a panic in the operation counts as a failure, while an abandoned
/// call (its future dropped) only gives its probe slot back.
struct CallGuard<'a> {
    breaker: &'a BreakerInner,
    permit: Option<Permit>,
    started_at: Instant,
}

impl CallGuard<'_> {
    fn elapsed(&self) -> Duration {
        self.breaker
            .clock
            .now()
            .saturating_duration_since(self.started_at)
    }

    fn complete<T, E>(mut self, result: Result<T, E>, elapsed: Duration) -> BreakerResult<T, E> {
        let Some(permit) = self.permit.take() else {
            return result.map_err(BreakerError::Operation);
        };

        let outcome = if result.is_ok() {
            CallOutcome::Success
        } else {
            CallOutcome::Failure
        };
        self.breaker.record_outcome(permit, outcome, elapsed);

        result.map_err(BreakerError::Operation)
    }

    fn timed_out<T, E>(mut self, elapsed: Duration, limit: Duration) -> BreakerResult<T, E> {
        if let Some(permit) = self.permit.take() {
            debug!(breaker = %self.breaker.name, ?elapsed, ?limit, "call timed out");
            self.breaker
                .record_outcome(permit, CallOutcome::Timeout, elapsed);
        }

        Err(BreakerError::Timeout { elapsed, limit })
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        let Some(permit) = self.permit.take() else {
            return;
        };

        if std::thread::panicking() {
            let elapsed = self.elapsed();
            self.breaker
                .record_outcome(permit, CallOutcome::Failure, elapsed);
        } else {
            debug!(breaker = %self.breaker.name, "call abandoned before completion");
            self.breaker.state_manager.release(permit);
            self.breaker.counters.record_abandoned();
        }
    }
}

// Implement Async support when the feature is enabled
#[cfg(feature = "async")]
impl CircuitBreaker {
    /// Executes an async function wrapped by the circuit breaker.
    ///
    /// Behaves like [`CircuitBreaker::call`]. With a call timeout configured
    /// the operation's future races a `tokio` timer; if the timer wins the
    /// future is dropped and the call counts as a failure. The timer needs a
    /// Tokio runtime; polled from anywhere else, a call with a timeout is
    /// rejected with [`InternalError::NoTimerRuntime`](crate::InternalError::NoTimerRuntime)
    /// and `f` never runs.
    pub async fn call_async<F, Fut, T, E>(&self, f: F) -> BreakerResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        if self.inner.config.call_timeout().is_some()
            && tokio::runtime::Handle::try_current().is_err()
        {
            return Err(self
                .inner
                .reject(Rejection::Internal(crate::error::InternalError::NoTimerRuntime)));
        }

        let guard = self.pre_call::<E>()?;

        let result = match self.inner.config.call_timeout() {
            Some(limit) => match tokio::time::timeout(limit, f()).await {
                Ok(result) => result,
                Err(_) => {
                    let elapsed = guard.elapsed().max(limit);
                    return guard.timed_out(elapsed, limit);
                }
            },
            None => f().await,
        };

        let elapsed = guard.elapsed();
        guard.complete(result, elapsed)
    }
}
