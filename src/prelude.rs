//! Re-exports the types most callers need.
//!
//! # Example
//! ```rust,no_run
//! use dependency_breaker::prelude::*;
//!
//! let breaker: CircuitBreaker = CircuitBreaker::new(BreakerConfig::default());
//! let result: BreakerResult<u32, std::io::Error> = breaker.call(|| Ok(7));
//! ```

pub use crate::breaker::CircuitBreaker;
pub use crate::config::{BreakerConfig, BreakerConfigInput};
pub use crate::error::{BreakerError, BreakerResult, ConfigError};
pub use crate::state::CircuitState;
