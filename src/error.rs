//! Error types for the circuit breaker library.

use std::time::Duration;

use thiserror::Error;

use crate::state::CircuitState;

/// Result type for circuit breaker operations.
pub type BreakerResult<T, E> = Result<T, BreakerError<E>>;

/// Error returned by [`CircuitBreaker::call`](crate::CircuitBreaker::call).
///
/// Only [`BreakerError::Operation`] comes from the protected operation; every
/// other variant is the breaker's own rejection, and in those cases the
/// operation was either never invoked or its result was discarded.
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The circuit is open and the call was short-circuited.
    #[error("circuit breaker is {state}, next probe in {retry_after:?}")]
    CircuitOpen {
        /// State observed when the call was rejected.
        state: CircuitState,
        /// Time left until the breaker admits a probe.
        retry_after: Duration,
    },

    /// The circuit is half-open and every probe slot is taken.
    #[error("circuit breaker probe limit exceeded ({in_flight}/{limit} probes in flight)")]
    ProbeLimitExceeded {
        /// Probes in flight when the call was rejected.
        in_flight: u32,
        /// Configured probe limit.
        limit: u32,
    },

    /// The operation ran past the configured call timeout. It was counted as a
    /// failure and its result discarded.
    #[error("operation timed out after {elapsed:?} (limit {limit:?})")]
    Timeout {
        /// How long the call ran before the breaker gave up on it.
        elapsed: Duration,
        /// Configured call timeout.
        limit: Duration,
    },

    /// The underlying operation failed. The error is passed through unchanged.
    #[error("operation error: {0}")]
    Operation(#[source] E),

    /// The breaker hit an internal defect and rejected the call.
    #[error("circuit breaker internal error: {0}")]
    Internal(InternalError),
}

impl<E> BreakerError<E> {
    /// Returns `true` when the breaker refused the call without running it.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            BreakerError::CircuitOpen { .. }
                | BreakerError::ProbeLimitExceeded { .. }
                | BreakerError::Internal(_)
        )
    }

    /// Returns the operation's own error, if that is what this is.
    pub fn into_operation(self) -> Option<E> {
        match self {
            BreakerError::Operation(e) => Some(e),
            _ => None,
        }
    }
}

/// Internal errors that can occur within the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InternalError {
    /// The clock reported an instant earlier than the last state change.
    #[error("clock went backwards past the last state change")]
    ClockWentBackwards,
    /// A call timeout needs a Tokio timer but no runtime was running.
    #[error("call timeout requires a Tokio runtime")]
    NoTimerRuntime,
}

/// Rejection of a [`BreakerConfigInput`](crate::BreakerConfigInput).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A required field was not supplied.
    #[error("invalid breaker config: missing required field `{0}`")]
    MissingField(&'static str),

    /// A field that must be positive was zero.
    #[error("invalid breaker config: `{0}` must be greater than zero")]
    NonPositive(&'static str),

    /// Half-open could never close because the success threshold exceeds the
    /// number of probes it may run at once.
    #[error(
        "invalid breaker config: success_threshold ({success_threshold}) exceeds \
         half_open_max_concurrent_probes ({max_probes})"
    )]
    SuccessThresholdExceedsProbes {
        /// Requested success threshold.
        success_threshold: u32,
        /// Requested probe limit.
        max_probes: u32,
    },

    /// The success threshold is above the supported bound.
    #[error("invalid breaker config: success_threshold ({success_threshold}) exceeds maximum of {max}")]
    SuccessThresholdTooLarge {
        /// Requested success threshold.
        success_threshold: u32,
        /// Largest accepted value.
        max: u32,
    },
}
