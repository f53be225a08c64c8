//! Configuration for circuit breakers.

use std::sync::Arc;
use std::time::Duration;

use crate::breaker::{CircuitBreaker, DEFAULT_BREAKER_NAME};
use crate::clock::{Clock, MonotonicClock};
use crate::error::ConfigError;
use crate::hook::HookRegistry;
use crate::metrics::{MetricSink, NullMetricSink};
use crate::policy::FailureCounting;

/// Largest accepted `success_threshold`.
pub const MAX_SUCCESS_THRESHOLD: u32 = 16;

/// Transition log capacity used when none is configured.
pub const DEFAULT_HISTORY_CAPACITY: usize = 128;

/// Unvalidated breaker settings, typically loaded from process configuration.
///
/// Durations are expressed in milliseconds. Every field is optional here so
/// that a missing value can be reported instead of silently defaulted; see
/// [`BreakerConfig::create`] for which ones are required.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default, deny_unknown_fields))]
pub struct BreakerConfigInput {
    /// Failures that trip the breaker open. Required.
    pub failure_threshold: Option<u32>,
    /// Consecutive half-open successes needed to close. Required.
    pub success_threshold: Option<u32>,
    /// How long the breaker stays open before probing. Required.
    pub open_timeout_ms: Option<u64>,
    /// Probes allowed in flight while half-open. Required.
    pub half_open_max_concurrent_probes: Option<u32>,
    /// Count failures within this window instead of consecutively.
    pub rolling_window_ms: Option<u64>,
    /// Per-call timeout.
    pub call_timeout_ms: Option<u64>,
    /// Maximum number of retained state transitions.
    pub history_capacity: Option<usize>,
}

/// Validated, immutable breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    failure_threshold: u32,
    success_threshold: u32,
    open_timeout: Duration,
    half_open_max_concurrent_probes: u32,
    rolling_window: Option<Duration>,
    call_timeout: Option<Duration>,
    history_capacity: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(30),
            half_open_max_concurrent_probes: 2,
            rolling_window: None,
            call_timeout: None,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

impl BreakerConfig {
    /// Validates `input` and builds a configuration from it.
    pub fn create(input: BreakerConfigInput) -> Result<Self, ConfigError> {
        let failure_threshold = positive(
            "failure_threshold",
            required("failure_threshold", input.failure_threshold)?,
        )?;
        let success_threshold = positive(
            "success_threshold",
            required("success_threshold", input.success_threshold)?,
        )?;
        let open_timeout_ms = positive(
            "open_timeout_ms",
            required("open_timeout_ms", input.open_timeout_ms)?,
        )?;
        let max_probes = positive(
            "half_open_max_concurrent_probes",
            required(
                "half_open_max_concurrent_probes",
                input.half_open_max_concurrent_probes,
            )?,
        )?;
        let rolling_window_ms = input
            .rolling_window_ms
            .map(|ms| positive("rolling_window_ms", ms))
            .transpose()?;
        let call_timeout_ms = input
            .call_timeout_ms
            .map(|ms| positive("call_timeout_ms", ms))
            .transpose()?;
        let history_capacity = positive(
            "history_capacity",
            input.history_capacity.unwrap_or(DEFAULT_HISTORY_CAPACITY),
        )?;

        if success_threshold > MAX_SUCCESS_THRESHOLD {
            return Err(ConfigError::SuccessThresholdTooLarge {
                success_threshold,
                max: MAX_SUCCESS_THRESHOLD,
            });
        }
        if success_threshold > max_probes {
            return Err(ConfigError::SuccessThresholdExceedsProbes {
                success_threshold,
                max_probes,
            });
        }

        Ok(Self {
            failure_threshold,
            success_threshold,
            open_timeout: Duration::from_millis(open_timeout_ms),
            half_open_max_concurrent_probes: max_probes,
            rolling_window: rolling_window_ms.map(Duration::from_millis),
            call_timeout: call_timeout_ms.map(Duration::from_millis),
            history_capacity,
        })
    }

    /// Failures that trip the breaker open.
    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// Consecutive half-open successes needed to close.
    pub fn success_threshold(&self) -> u32 {
        self.success_threshold
    }

    /// How long the breaker stays open before admitting a probe.
    pub fn open_timeout(&self) -> Duration {
        self.open_timeout
    }

    /// Probes allowed in flight while half-open.
    pub fn half_open_max_concurrent_probes(&self) -> u32 {
        self.half_open_max_concurrent_probes
    }

    /// Window over which failures are counted, if not counting consecutively.
    pub fn rolling_window(&self) -> Option<Duration> {
        self.rolling_window
    }

    /// Per-call timeout, if any.
    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout
    }

    /// Maximum number of retained state transitions.
    pub fn history_capacity(&self) -> usize {
        self.history_capacity
    }

    pub(crate) fn failure_counting(&self) -> FailureCounting {
        match self.rolling_window {
            Some(window) => FailureCounting::RollingWindow(window),
            None => FailureCounting::Consecutive,
        }
    }

    fn to_input(&self) -> BreakerConfigInput {
        BreakerConfigInput {
            failure_threshold: Some(self.failure_threshold),
            success_threshold: Some(self.success_threshold),
            open_timeout_ms: Some(millis(self.open_timeout)),
            half_open_max_concurrent_probes: Some(self.half_open_max_concurrent_probes),
            rolling_window_ms: self.rolling_window.map(millis),
            call_timeout_ms: self.call_timeout.map(millis),
            history_capacity: Some(self.history_capacity),
        }
    }
}

fn required<T>(field: &'static str, value: Option<T>) -> Result<T, ConfigError> {
    value.ok_or(ConfigError::MissingField(field))
}

fn positive<T>(field: &'static str, value: T) -> Result<T, ConfigError>
where
    T: PartialOrd + Default,
{
    if value > T::default() {
        Ok(value)
    } else {
        Err(ConfigError::NonPositive(field))
    }
}

/// Whole milliseconds, rounded up so a positive duration never becomes zero.
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos().div_ceil(1_000_000)).unwrap_or(u64::MAX)
}

/// Builder for creating circuit breakers with custom configurations.
///
/// Starts from [`BreakerConfig::default`]; validation happens in
/// [`BreakerBuilder::build`].
pub struct BreakerBuilder {
    name: String,
    input: BreakerConfigInput,
    clock: Arc<dyn Clock>,
    metric_sink: Arc<dyn MetricSink>,
    hook_registry: Arc<HookRegistry>,
}

impl Default for BreakerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BreakerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            name: DEFAULT_BREAKER_NAME.to_owned(),
            input: BreakerConfig::default().to_input(),
            clock: Arc::new(MonotonicClock),
            metric_sink: Arc::new(NullMetricSink),
            hook_registry: Arc::new(HookRegistry::new()),
        }
    }

    /// Names the breaker, usually after the dependency it protects.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Replaces every setting with the ones in `input`.
    pub fn config_input(mut self, input: BreakerConfigInput) -> Self {
        self.input = input;
        self
    }

    /// Sets the number of failures required to trip the circuit.
    pub fn failure_threshold(mut self, count: u32) -> Self {
        self.input.failure_threshold = Some(count);
        self
    }

    /// Sets the number of consecutive half-open successes required to close the circuit.
    pub fn success_threshold(mut self, count: u32) -> Self {
        self.input.success_threshold = Some(count);
        self
    }

    /// Sets how long the circuit stays open before a probe is admitted.
    pub fn open_timeout(mut self, duration: Duration) -> Self {
        self.input.open_timeout_ms = Some(millis(duration));
        self
    }

    /// Sets the number of probes allowed in flight while half-open.
    pub fn half_open_max_concurrent_probes(mut self, count: u32) -> Self {
        self.input.half_open_max_concurrent_probes = Some(count);
        self
    }

    /// Counts failures within a rolling window instead of consecutively.
    pub fn rolling_window(mut self, window: Duration) -> Self {
        self.input.rolling_window_ms = Some(millis(window));
        self
    }

    /// Treats calls running longer than `timeout` as failures.
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.input.call_timeout_ms = Some(millis(timeout));
        self
    }

    /// Sets how many state transitions are retained.
    pub fn history_capacity(mut self, capacity: usize) -> Self {
        self.input.history_capacity = Some(capacity);
        self
    }

    /// Sets the time source.
    pub fn clock<C: Clock>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Sets a metric sink for the circuit breaker.
    pub fn metric_sink<M: MetricSink>(mut self, sink: M) -> Self {
        self.metric_sink = Arc::new(sink);
        self
    }

    /// Sets a hook registry for the circuit breaker.
    pub fn hooks(mut self, hooks: HookRegistry) -> Self {
        self.hook_registry = Arc::new(hooks);
        self
    }

    /// Validates the settings and builds the circuit breaker.
    pub fn build(self) -> Result<CircuitBreaker, ConfigError> {
        let config = BreakerConfig::create(self.input)?;
        Ok(CircuitBreaker::from_parts(
            self.name,
            config,
            self.clock,
            self.metric_sink,
            self.hook_registry,
        ))
    }
}
