//! Shows concurrent async callers against a slow auth provider: calls that
//! exceed the call timeout count as failures, and once the breaker is open
//! only a bounded number of probes reach the provider.

use dependency_breaker::{BreakerError, CircuitBreaker};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
struct AuthError;

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "auth provider error")
    }
}

impl std::error::Error for AuthError {}

async fn verify_token(latency: Duration) -> Result<&'static str, AuthError> {
    tokio::time::sleep(latency).await;
    Ok("user-42")
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("dependency_breaker=info")
        .init();

    let breaker = CircuitBreaker::builder()
        .name("auth-provider")
        .failure_threshold(2)
        .success_threshold(1)
        .half_open_max_concurrent_probes(1)
        .open_timeout(Duration::from_millis(200))
        .call_timeout(Duration::from_millis(50))
        .build()?;

    // The provider is too slow: two timeouts trip the breaker.
    for _ in 0..2 {
        let result = breaker
            .call_async(|| verify_token(Duration::from_millis(100)))
            .await;
        println!("slow call: {:?}", result.map_err(|e| e.to_string()));
    }
    println!("state after timeouts: {}", breaker.current_state());

    tokio::time::sleep(Duration::from_millis(250)).await;

    // Ten callers race for the single probe slot.
    let reached_provider = Arc::new(AtomicU32::new(0));
    let mut tasks = Vec::new();
    for _ in 0..10 {
        let breaker = breaker.clone();
        let reached_provider = Arc::clone(&reached_provider);
        tasks.push(tokio::spawn(async move {
            breaker
                .call_async(|| async {
                    reached_provider.fetch_add(1, Ordering::SeqCst);
                    verify_token(Duration::from_millis(10)).await
                })
                .await
        }));
    }

    for task in tasks {
        match task.await? {
            Ok(user) => println!("probe verified {user}"),
            Err(BreakerError::ProbeLimitExceeded { in_flight, limit }) => {
                println!("rejected: {in_flight}/{limit} probes in flight")
            }
            Err(err) => println!("rejected: {err}"),
        }
    }

    println!(
        "{} caller(s) reached the provider, state {}",
        reached_provider.load(Ordering::SeqCst),
        breaker.current_state()
    );
    Ok(())
}
