//! Guards a flaky storage backend with a circuit breaker and prints what the
//! breaker does on every call.

use dependency_breaker::{BreakerError, CircuitBreaker, HookRegistry};
use std::error::Error;
use std::fmt;
use std::thread;
use std::time::Duration;

#[derive(Debug)]
struct StorageError(String);

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "storage error: {}", self.0)
    }
}

impl Error for StorageError {}

// Succeeds three times, fails five times, then recovers for good.
fn read_object(attempt: u32) -> Result<String, StorageError> {
    match attempt {
        0..=2 => Ok(format!("object #{attempt}")),
        3..=7 => Err(StorageError("backend unavailable".to_string())),
        _ => Ok(format!("object #{attempt} (recovered)")),
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("dependency_breaker=debug")
        .init();

    let hooks = HookRegistry::new();
    hooks.set_on_open(|t| println!("  -> circuit OPEN ({})", t.reason));
    hooks.set_on_half_open(|_| println!("  -> circuit HALF-OPEN, probing"));
    hooks.set_on_close(|t| println!("  -> circuit CLOSED ({})", t.reason));

    let breaker = CircuitBreaker::builder()
        .name("object-store")
        .failure_threshold(3)
        .success_threshold(2)
        .half_open_max_concurrent_probes(2)
        .open_timeout(Duration::from_secs(1))
        .hooks(hooks)
        .build()?;

    let mut attempt = 0;
    for i in 1..=15 {
        print!("call {i:>2}: ");
        match breaker.call(|| {
            let result = read_object(attempt);
            attempt += 1;
            result
        }) {
            Ok(object) => println!("ok, {object}"),
            Err(BreakerError::CircuitOpen { retry_after, .. }) => {
                println!("short-circuited, next probe in {retry_after:?}");
                thread::sleep(retry_after);
            }
            Err(BreakerError::Operation(err)) => println!("failed, {err}"),
            Err(err) => println!("rejected, {err}"),
        }
    }

    let metrics = breaker.metrics();
    println!(
        "\n{} calls, {} failures, {} short-circuited, error rate {:.2}, now {}",
        metrics.total_calls,
        metrics.total_failures,
        metrics.total_short_circuited,
        metrics.error_rate(),
        metrics.state
    );
    for transition in breaker.state_history() {
        println!("{} -> {}: {}", transition.from, transition.to, transition.reason);
    }

    Ok(())
}
