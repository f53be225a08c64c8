//! Call accounting and metrics export for the circuit breaker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::state::{CircuitState, StateTransition};

/// How a dispatched call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallOutcome {
    /// The operation returned `Ok`.
    Success,
    /// The operation returned `Err` or panicked.
    Failure,
    /// The operation exceeded the call timeout.
    Timeout,
}

impl CallOutcome {
    /// Lower-case name used in metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            CallOutcome::Success => "success",
            CallOutcome::Failure => "failure",
            CallOutcome::Timeout => "timeout",
        }
    }
}

/// Why a call was refused without being dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectionKind {
    /// The circuit was open.
    CircuitOpen,
    /// Every half-open probe slot was taken.
    ProbeLimitExceeded,
    /// The breaker failed closed on an internal defect.
    Internal,
}

impl RejectionKind {
    /// Lower-case name used in metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionKind::CircuitOpen => "circuit-open",
            RejectionKind::ProbeLimitExceeded => "probe-limit-exceeded",
            RejectionKind::Internal => "internal",
        }
    }
}

/// Trait for metrics sinks that can receive circuit breaker events.
pub trait MetricSink: Send + Sync + 'static {
    /// Records a state transition event.
    fn record_state_transition(&self, transition: &StateTransition);

    /// Records the outcome of a dispatched call.
    fn record_call(&self, outcome: CallOutcome, duration: Duration);

    /// Records a call the breaker refused.
    fn record_rejection(&self, kind: RejectionKind);
}

/// A null metrics sink that discards all events.
pub struct NullMetricSink;

impl MetricSink for NullMetricSink {
    fn record_state_transition(&self, _transition: &StateTransition) {}
    fn record_call(&self, _outcome: CallOutcome, _duration: Duration) {}
    fn record_rejection(&self, _kind: RejectionKind) {}
}

/// Read-only view of a breaker's counters and state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Every call made through the breaker, rejected or not.
    pub total_calls: u64,
    /// Dispatched calls that succeeded.
    pub total_successes: u64,
    /// Dispatched calls that failed, timeouts included.
    pub total_failures: u64,
    /// Calls rejected because the circuit was open.
    pub total_short_circuited: u64,
    /// Calls rejected because every probe slot was taken.
    pub total_probe_rejections: u64,
    /// Dispatched calls that ran past the call timeout.
    pub total_timeouts: u64,
    /// State at the time of the snapshot.
    pub state: CircuitState,
    /// Time spent in `state` so far.
    pub time_in_state: Duration,
}

impl MetricsSnapshot {
    /// Failed share of dispatched calls, `0.0` when nothing was dispatched.
    pub fn error_rate(&self) -> f64 {
        let dispatched = self.total_successes + self.total_failures;
        if dispatched == 0 {
            return 0.0;
        }

        self.total_failures as f64 / dispatched as f64
    }
}

/// Monotonic counters behind [`MetricsSnapshot`].
#[derive(Debug, Default)]
pub(crate) struct BreakerCounters {
    total_calls: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    short_circuited: AtomicU64,
    probe_rejections: AtomicU64,
    timeouts: AtomicU64,
}

impl BreakerCounters {
    pub(crate) fn record_call(&self, outcome: CallOutcome) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        match outcome {
            CallOutcome::Success => {
                self.successes.fetch_add(1, Ordering::Relaxed);
            }
            CallOutcome::Failure => {
                self.failures.fetch_add(1, Ordering::Relaxed);
            }
            CallOutcome::Timeout => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                self.timeouts.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub(crate) fn record_rejection(&self, kind: RejectionKind) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        match kind {
            RejectionKind::CircuitOpen | RejectionKind::Internal => {
                self.short_circuited.fetch_add(1, Ordering::Relaxed);
            }
            RejectionKind::ProbeLimitExceeded => {
                self.probe_rejections.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Abandoned calls count as calls but have no outcome.
    pub(crate) fn record_abandoned(&self) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, state: CircuitState, time_in_state: Duration) -> MetricsSnapshot {
        MetricsSnapshot {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_successes: self.successes.load(Ordering::Relaxed),
            total_failures: self.failures.load(Ordering::Relaxed),
            total_short_circuited: self.short_circuited.load(Ordering::Relaxed),
            total_probe_rejections: self.probe_rejections.load(Ordering::Relaxed),
            total_timeouts: self.timeouts.load(Ordering::Relaxed),
            state,
            time_in_state,
        }
    }
}

#[cfg(feature = "prometheus")]
pub use self::prometheus::PrometheusSink;

#[cfg(feature = "prometheus")]
mod prometheus {
    use std::time::Duration;

    use prometheus_client::encoding::EncodeLabelSet;
    use prometheus_client::metrics::counter::Counter;
    use prometheus_client::metrics::family::Family;
    use prometheus_client::metrics::gauge::Gauge;
    use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
    use prometheus_client::registry::Registry;

    use super::{CallOutcome, MetricSink, RejectionKind};
    use crate::state::StateTransition;

    #[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
    struct BreakerLabels {
        breaker: String,
    }

    #[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
    struct CallLabels {
        breaker: String,
        outcome: String,
    }

    #[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
    struct RejectionLabels {
        breaker: String,
        reason: String,
    }

    #[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
    struct TransitionLabels {
        breaker: String,
        from: String,
        to: String,
    }

    /// Publishes breaker events to a `prometheus-client` registry.
    ///
    /// State is exported as a gauge: 0 closed, 1 open, 2 half-open.
    pub struct PrometheusSink {
        breaker: String,
        calls: Family<CallLabels, Counter>,
        call_duration: Family<CallLabels, Histogram, fn() -> Histogram>,
        rejections: Family<RejectionLabels, Counter>,
        transitions: Family<TransitionLabels, Counter>,
        state: Family<BreakerLabels, Gauge>,
    }

    impl PrometheusSink {
        /// Creates a sink for the breaker called `breaker` and registers its
        /// metrics with `registry`.
        pub fn new(breaker: impl Into<String>, registry: &mut Registry) -> Self {
            let sink = Self {
                breaker: breaker.into(),
                calls: Family::default(),
                call_duration: Family::new_with_constructor(|| {
                    Histogram::new(exponential_buckets(0.001, 2.0, 16))
                }),
                rejections: Family::default(),
                transitions: Family::default(),
                state: Family::default(),
            };

            registry.register(
                "circuit_breaker_calls",
                "Calls dispatched through the circuit breaker",
                sink.calls.clone(),
            );
            registry.register(
                "circuit_breaker_call_duration_seconds",
                "Duration of dispatched calls",
                sink.call_duration.clone(),
            );
            registry.register(
                "circuit_breaker_rejections",
                "Calls rejected without being dispatched",
                sink.rejections.clone(),
            );
            registry.register(
                "circuit_breaker_transitions",
                "Circuit breaker state transitions",
                sink.transitions.clone(),
            );
            registry.register(
                "circuit_breaker_state",
                "Current circuit breaker state",
                sink.state.clone(),
            );

            sink.state
                .get_or_create(&BreakerLabels {
                    breaker: sink.breaker.clone(),
                })
                .set(0);
            sink
        }
    }

    impl MetricSink for PrometheusSink {
        fn record_state_transition(&self, transition: &StateTransition) {
            self.transitions
                .get_or_create(&TransitionLabels {
                    breaker: self.breaker.clone(),
                    from: transition.from.as_str().to_owned(),
                    to: transition.to.as_str().to_owned(),
                })
                .inc();
            self.state
                .get_or_create(&BreakerLabels {
                    breaker: self.breaker.clone(),
                })
                .set(transition.to as i64);
        }

        fn record_call(&self, outcome: CallOutcome, duration: Duration) {
            let labels = CallLabels {
                breaker: self.breaker.clone(),
                outcome: outcome.as_str().to_owned(),
            };
            self.calls.get_or_create(&labels).inc();
            self.call_duration
                .get_or_create(&labels)
                .observe(duration.as_secs_f64());
        }

        fn record_rejection(&self, kind: RejectionKind) {
            self.rejections
                .get_or_create(&RejectionLabels {
                    breaker: self.breaker.clone(),
                    reason: kind.as_str().to_owned(),
                })
                .inc();
        }
    }
}
