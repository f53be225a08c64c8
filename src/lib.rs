//! # dependency-breaker
//!
//! An in-process circuit breaker that guards calls to an unreliable
//! downstream dependency (a database, a storage backend, an external auth
//! provider) and stops issuing calls once it keeps failing.
//!
//! ## States
//!
//! - **Closed**: Normal operation. Calls pass through to the dependency.
//! - **Open**: Calls are rejected immediately without reaching the dependency.
//! - **Half-Open**: Once the open timeout has elapsed, a limited number of probe
//!   calls are let through to check whether the dependency has recovered.
//!
//! Failures are counted consecutively by default, or within a rolling window
//! when one is configured. Every state change is logged through `tracing`,
//! forwarded to the configured [`MetricSink`] and hooks, and kept in a bounded
//! transition history.
//!
//! ## Basic Usage
//!
//! ```rust
//! use dependency_breaker::{BreakerError, CircuitBreaker};
//! use std::time::Duration;
//!
//! #[derive(Debug)]
//! struct DbError(String);
//!
//! impl std::fmt::Display for DbError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "database error: {}", self.0)
//!     }
//! }
//!
//! impl std::error::Error for DbError {}
//!
//! let breaker = CircuitBreaker::builder()
//!     .name("postgres")
//!     .failure_threshold(3)
//!     .success_threshold(1)
//!     .half_open_max_concurrent_probes(1)
//!     .open_timeout(Duration::from_secs(30))
//!     .build()
//!     .expect("valid breaker config");
//!
//! match breaker.call(|| Ok::<_, DbError>("row".to_string())) {
//!     Ok(row) => println!("fetched {row}"),
//!     Err(BreakerError::CircuitOpen { retry_after, .. }) => {
//!         println!("database unavailable, retry in {retry_after:?}")
//!     }
//!     Err(BreakerError::Operation(err)) => println!("query failed: {err}"),
//!     Err(err) => println!("rejected: {err}"),
//! }
//! ```
//!
//! ## Async Support
//!
//! With the `async` feature (on by default), futures can be guarded too. A
//! configured call timeout is enforced with a Tokio timer:
//!
//! ```rust,ignore
//! let user = breaker
//!     .call_async(|| async { auth_client.lookup(user_id).await })
//!     .await?;
//! ```
//!
//! ## Testing With a Manual Clock
//!
//! Timeouts are evaluated against an injected [`Clock`]. [`ManualClock`] only
//! moves when advanced, which makes open-timeout behaviour deterministic:
//!
//! ```rust
//! use dependency_breaker::{CircuitBreaker, CircuitState, ManualClock};
//! use std::time::Duration;
//!
//! let clock = ManualClock::new();
//! let breaker = CircuitBreaker::builder()
//!     .failure_threshold(1)
//!     .success_threshold(1)
//!     .half_open_max_concurrent_probes(1)
//!     .open_timeout(Duration::from_secs(10))
//!     .clock(clock.clone())
//!     .build()
//!     .unwrap();
//!
//! let _ = breaker.call(|| Err::<(), _>("boom"));
//! assert_eq!(breaker.current_state(), CircuitState::Open);
//!
//! clock.advance(Duration::from_secs(10));
//! assert!(breaker.call(|| Ok::<_, &str>(())).is_ok());
//! assert_eq!(breaker.current_state(), CircuitState::Closed);
//! ```
//!
//! ## Features
//!
//! - `async` - Async support with Tokio (default)
//! - `serde` - Deserialize [`BreakerConfigInput`] from external configuration
//! - `prometheus` - Prometheus metrics integration

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod breaker;
mod clock;
mod config;
mod error;
mod history;
mod hook;
mod metrics;
mod policy;
pub mod prelude;
mod state;

// Re-exports
pub use breaker::{CircuitBreaker, DEFAULT_BREAKER_NAME};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{
    BreakerBuilder, BreakerConfig, BreakerConfigInput, DEFAULT_HISTORY_CAPACITY,
    MAX_SUCCESS_THRESHOLD,
};
pub use error::{BreakerError, BreakerResult, ConfigError, InternalError};
pub use hook::HookRegistry;
#[cfg(feature = "prometheus")]
pub use metrics::PrometheusSink;
pub use metrics::{CallOutcome, MetricSink, MetricsSnapshot, NullMetricSink, RejectionKind};
pub use policy::FailureCounting;
pub use state::{BreakerStateData, CircuitState, StateTransition, TransitionReason};
