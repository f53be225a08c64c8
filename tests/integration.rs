use dependency_breaker::{
    BreakerConfig, BreakerConfigInput, BreakerError, CallOutcome, CircuitBreaker, CircuitState,
    ConfigError, HookRegistry, InternalError, ManualClock, MetricSink, RejectionKind,
    StateTransition, TransitionReason,
};
use std::error::Error;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

// Custom error type that implements Error trait
#[derive(Debug, PartialEq)]
struct TestError(String);

impl TestError {
    fn new(msg: &str) -> Self {
        TestError(msg.to_string())
    }
}

impl fmt::Display for TestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Test error: {}", self.0)
    }
}

impl Error for TestError {}

fn breaker(clock: &ManualClock, failures: u32, successes: u32, probes: u32) -> CircuitBreaker {
    CircuitBreaker::builder()
        .failure_threshold(failures)
        .success_threshold(successes)
        .half_open_max_concurrent_probes(probes)
        .open_timeout(Duration::from_secs(1))
        .clock(clock.clone())
        .build()
        .unwrap()
}

fn fail(breaker: &CircuitBreaker) -> Result<String, BreakerError<TestError>> {
    breaker.call(|| Err(TestError::new("error")))
}

fn succeed(breaker: &CircuitBreaker) -> Result<String, BreakerError<TestError>> {
    breaker.call(|| Ok("success".to_string()))
}

#[test]
fn test_trip_probe_and_recover_scenario() {
    let clock = ManualClock::new();
    let breaker = breaker(&clock, 3, 1, 1);
    assert_eq!(breaker.current_state(), CircuitState::Closed);

    for _ in 0..3 {
        assert!(matches!(fail(&breaker), Err(BreakerError::Operation(_))));
    }
    assert_eq!(breaker.current_state(), CircuitState::Open);

    // Within the open timeout the operation must not run.
    clock.advance(Duration::from_millis(300));
    let invoked = AtomicU32::new(0);
    let result = breaker.call(|| {
        invoked.fetch_add(1, Ordering::SeqCst);
        Ok::<_, TestError>(())
    });
    match result {
        Err(BreakerError::CircuitOpen { state, retry_after }) => {
            assert_eq!(state, CircuitState::Open);
            assert_eq!(retry_after, Duration::from_millis(700));
        }
        other => panic!("expected CircuitOpen, got {other:?}"),
    }
    assert_eq!(invoked.load(Ordering::SeqCst), 0);

    // The first call after the timeout is dispatched as a probe.
    clock.advance(Duration::from_millis(700));
    let observed = Mutex::new(None);
    let result = breaker.call(|| {
        *observed.lock().unwrap() = Some(breaker.current_state());
        Ok::<_, TestError>("probe")
    });
    assert_eq!(result.unwrap(), "probe");
    assert_eq!(*observed.lock().unwrap(), Some(CircuitState::HalfOpen));
    assert_eq!(breaker.current_state(), CircuitState::Closed);

    let reasons: Vec<_> = breaker
        .state_history()
        .into_iter()
        .map(|t| (t.from, t.to, t.reason))
        .collect();
    assert_eq!(
        reasons,
        vec![
            (
                CircuitState::Closed,
                CircuitState::Open,
                TransitionReason::FailureThresholdReached { failures: 3 }
            ),
            (
                CircuitState::Open,
                CircuitState::HalfOpen,
                TransitionReason::OpenTimeoutElapsed
            ),
            (
                CircuitState::HalfOpen,
                CircuitState::Closed,
                TransitionReason::ProbesSucceeded { successes: 1 }
            ),
        ]
    );
}

#[test]
fn test_half_open_failure_reopens() {
    let clock = ManualClock::new();
    let breaker = breaker(&clock, 1, 1, 1);

    let _ = fail(&breaker);
    assert_eq!(breaker.current_state(), CircuitState::Open);
    let first_opened = breaker.state_data().last_state_change_at;

    clock.advance(Duration::from_secs(2));
    let result = fail(&breaker);
    assert!(matches!(result, Err(BreakerError::Operation(_))));

    let data = breaker.state_data();
    assert_eq!(data.state, CircuitState::Open);
    assert_eq!(data.consecutive_successes, 0);
    assert_eq!(data.last_state_change_at, first_opened + Duration::from_secs(2));

    // The refreshed timestamp restarts the open timeout.
    assert!(matches!(
        succeed(&breaker),
        Err(BreakerError::CircuitOpen { .. })
    ));
}

#[test]
fn test_success_threshold_resets_counters() {
    let clock = ManualClock::new();
    let breaker = breaker(&clock, 2, 2, 2);

    let _ = fail(&breaker);
    let _ = fail(&breaker);
    clock.advance(Duration::from_secs(1));

    assert!(succeed(&breaker).is_ok());
    let data = breaker.state_data();
    assert_eq!(data.state, CircuitState::HalfOpen);
    assert_eq!(data.consecutive_successes, 1);

    assert!(succeed(&breaker).is_ok());
    let data = breaker.state_data();
    assert_eq!(data.state, CircuitState::Closed);
    assert_eq!(data.consecutive_failures, 0);
    assert_eq!(data.consecutive_successes, 0);
}

#[test]
fn test_operation_error_passes_through_unchanged() {
    let clock = ManualClock::new();
    let breaker = breaker(&clock, 5, 1, 1);

    let err = fail(&breaker).unwrap_err();
    assert!(!err.is_rejection());
    assert_eq!(err.into_operation(), Some(TestError::new("error")));
    assert_eq!(breaker.state_data().consecutive_failures, 1);
}

#[test]
fn test_sync_call_timeout_counts_as_failure() {
    let clock = ManualClock::new();
    let breaker = CircuitBreaker::builder()
        .failure_threshold(2)
        .success_threshold(1)
        .half_open_max_concurrent_probes(1)
        .call_timeout(Duration::from_millis(100))
        .clock(clock.clone())
        .build()
        .unwrap();

    let result = breaker.call(|| {
        clock.advance(Duration::from_millis(150));
        Ok::<_, TestError>("late")
    });
    match result {
        Err(BreakerError::Timeout { elapsed, limit }) => {
            assert_eq!(elapsed, Duration::from_millis(150));
            assert_eq!(limit, Duration::from_millis(100));
        }
        other => panic!("expected Timeout, got {other:?}"),
    }

    let metrics = breaker.metrics();
    assert_eq!(metrics.total_failures, 1);
    assert_eq!(metrics.total_timeouts, 1);
    assert_eq!(breaker.state_data().consecutive_failures, 1);
}

#[test]
fn test_panicking_operation_is_recorded_then_propagated() {
    let clock = ManualClock::new();
    let breaker = breaker(&clock, 1, 1, 1);

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        breaker.call(|| -> Result<(), TestError> { panic!("driver crashed") })
    }));

    let payload = outcome.unwrap_err();
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"driver crashed"));
    assert_eq!(breaker.current_state(), CircuitState::Open);
    assert_eq!(breaker.metrics().total_failures, 1);
}

#[test]
fn test_metrics_snapshot_is_idempotent() {
    let clock = ManualClock::new();
    let breaker = breaker(&clock, 2, 1, 1);

    let _ = succeed(&breaker);
    let _ = fail(&breaker);
    let _ = fail(&breaker);
    let _ = succeed(&breaker);
    clock.advance(Duration::from_millis(250));

    let first = breaker.metrics();
    let second = breaker.metrics();
    assert_eq!(first, second);

    assert_eq!(first.total_calls, 4);
    assert_eq!(first.total_successes, 1);
    assert_eq!(first.total_failures, 2);
    assert_eq!(first.total_short_circuited, 1);
    assert_eq!(first.state, CircuitState::Open);
    assert_eq!(first.time_in_state, Duration::from_millis(250));
}

#[test]
fn test_invalid_config_is_rejected() {
    let result = CircuitBreaker::builder()
        .success_threshold(2)
        .half_open_max_concurrent_probes(1)
        .build();
    assert_eq!(
        result.unwrap_err(),
        ConfigError::SuccessThresholdExceedsProbes {
            success_threshold: 2,
            max_probes: 1,
        }
    );

    let result = BreakerConfig::create(BreakerConfigInput {
        failure_threshold: Some(3),
        success_threshold: Some(1),
        half_open_max_concurrent_probes: Some(1),
        ..Default::default()
    });
    assert_eq!(result, Err(ConfigError::MissingField("open_timeout_ms")));
}

#[test]
fn test_force_state_and_manual_control() {
    let clock = ManualClock::new();
    let breaker = breaker(&clock, 5, 1, 1);

    // Force open
    assert!(breaker.force_open());
    assert_eq!(breaker.current_state(), CircuitState::Open);
    assert!(matches!(
        succeed(&breaker),
        Err(BreakerError::CircuitOpen { .. })
    ));

    // Trying to open again should return false (no change)
    assert!(!breaker.force_open());

    // Force closed
    assert!(breaker.force_closed());
    assert_eq!(breaker.current_state(), CircuitState::Closed);
    assert!(!breaker.force_closed());

    // An explicit force is recorded even when it changes nothing.
    let transition = breaker.force_state(CircuitState::Closed, "maintenance window ended");
    assert_eq!(transition.from, CircuitState::Closed);
    assert_eq!(
        transition.reason,
        TransitionReason::Forced("maintenance window ended".into())
    );
    assert_eq!(breaker.state_history().len(), 3);
}

#[test]
fn test_history_is_bounded() {
    let clock = ManualClock::new();
    let breaker = CircuitBreaker::builder()
        .history_capacity(2)
        .clock(clock.clone())
        .build()
        .unwrap();

    breaker.force_state(CircuitState::Open, "one");
    breaker.force_state(CircuitState::HalfOpen, "two");
    breaker.force_state(CircuitState::Closed, "three");

    let history = breaker.state_history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].reason, TransitionReason::Forced("two".into()));
    assert_eq!(history[1].reason, TransitionReason::Forced("three".into()));
}

#[test]
fn test_rolling_window_counts_spread_out_failures() {
    let clock = ManualClock::new();
    let breaker = CircuitBreaker::builder()
        .failure_threshold(3)
        .success_threshold(1)
        .half_open_max_concurrent_probes(1)
        .rolling_window(Duration::from_secs(10))
        .clock(clock.clone())
        .build()
        .unwrap();

    // Successes in between do not reset a windowed count.
    let _ = fail(&breaker);
    let _ = succeed(&breaker);
    clock.advance(Duration::from_secs(5));
    let _ = fail(&breaker);
    let _ = succeed(&breaker);
    assert_eq!(breaker.current_state(), CircuitState::Closed);

    // The first failure ages out of the window before the third arrives.
    clock.advance(Duration::from_secs(6));
    let _ = fail(&breaker);
    assert_eq!(breaker.current_state(), CircuitState::Closed);

    let _ = fail(&breaker);
    assert_eq!(breaker.current_state(), CircuitState::Open);
}

#[test]
fn test_hooks_observe_transitions_and_rejections() {
    let clock = ManualClock::new();
    let events = Arc::new(Mutex::new(Vec::new()));

    let hooks = HookRegistry::new();
    let sink = Arc::clone(&events);
    hooks.set_on_open(move |t| sink.lock().unwrap().push(format!("open: {}", t.reason)));
    let sink = Arc::clone(&events);
    hooks.set_on_half_open(move |_| sink.lock().unwrap().push("half-open".to_string()));
    let sink = Arc::clone(&events);
    hooks.set_on_close(move |_| sink.lock().unwrap().push("closed".to_string()));
    let sink = Arc::clone(&events);
    hooks.set_on_rejected(move |kind| sink.lock().unwrap().push(kind.as_str().to_string()));

    let breaker = CircuitBreaker::builder()
        .failure_threshold(1)
        .success_threshold(1)
        .half_open_max_concurrent_probes(1)
        .open_timeout(Duration::from_secs(1))
        .clock(clock.clone())
        .hooks(hooks)
        .build()
        .unwrap();

    let _ = fail(&breaker);
    let _ = succeed(&breaker);
    clock.advance(Duration::from_secs(1));
    let _ = succeed(&breaker);

    assert_eq!(
        *events.lock().unwrap(),
        vec![
            "open: failure threshold reached (1 failures)".to_string(),
            RejectionKind::CircuitOpen.as_str().to_string(),
            "half-open".to_string(),
            "closed".to_string(),
        ]
    );
}

// Parks delivery of the first open transition on a two-party barrier.
struct TransitionGate {
    seen: Mutex<Vec<CircuitState>>,
    barrier: Barrier,
    armed: AtomicBool,
}

struct GatedSink(Arc<TransitionGate>);

impl MetricSink for GatedSink {
    fn record_state_transition(&self, transition: &StateTransition) {
        self.0.seen.lock().unwrap().push(transition.to);
        if transition.to == CircuitState::Open && self.0.armed.swap(false, Ordering::SeqCst) {
            self.0.barrier.wait();
            self.0.barrier.wait();
        }
    }

    fn record_call(&self, _outcome: CallOutcome, _duration: Duration) {}

    fn record_rejection(&self, _kind: RejectionKind) {}
}

#[test]
fn test_sink_sees_transitions_in_history_order() {
    let gate = Arc::new(TransitionGate {
        seen: Mutex::new(Vec::new()),
        barrier: Barrier::new(2),
        armed: AtomicBool::new(true),
    });
    let breaker = CircuitBreaker::builder()
        .failure_threshold(1)
        .success_threshold(1)
        .half_open_max_concurrent_probes(1)
        .metric_sink(GatedSink(Arc::clone(&gate)))
        .build()
        .unwrap();

    let tripping = {
        let breaker = breaker.clone();
        thread::spawn(move || {
            let _ = fail(&breaker);
        })
    };

    // The open transition is being delivered; close the circuit meanwhile.
    gate.barrier.wait();
    assert!(breaker.force_closed());
    gate.barrier.wait();
    tripping.join().unwrap();

    let history: Vec<_> = breaker.state_history().iter().map(|t| t.to).collect();
    assert_eq!(history, vec![CircuitState::Open, CircuitState::Closed]);
    assert_eq!(*gate.seen.lock().unwrap(), history);
    assert_eq!(
        gate.seen.lock().unwrap().last(),
        Some(&breaker.current_state())
    );
}

#[cfg(feature = "prometheus")]
mod prometheus_export {
    use super::*;
    use dependency_breaker::PrometheusSink;
    use prometheus_client::encoding::text::encode;
    use prometheus_client::registry::Registry;

    fn exported(registry: &Registry) -> String {
        let mut out = String::new();
        encode(&mut out, registry).unwrap();
        out
    }

    fn assert_series(out: &str, series: &str) {
        assert!(
            out.lines().any(|line| line == series),
            "missing `{series}` in:\n{out}"
        );
    }

    #[test]
    fn test_prometheus_sink_exports_a_recovery_cycle() {
        let clock = ManualClock::new();
        let mut registry = Registry::default();
        let sink = PrometheusSink::new("payments", &mut registry);
        let breaker = CircuitBreaker::builder()
            .name("payments")
            .failure_threshold(1)
            .success_threshold(1)
            .half_open_max_concurrent_probes(1)
            .open_timeout(Duration::from_secs(1))
            .clock(clock.clone())
            .metric_sink(sink)
            .build()
            .unwrap();
        assert_series(&exported(&registry), r#"circuit_breaker_state{breaker="payments"} 0"#);

        let _ = fail(&breaker);
        let _ = succeed(&breaker);
        assert_series(&exported(&registry), r#"circuit_breaker_state{breaker="payments"} 1"#);

        clock.advance(Duration::from_secs(1));
        assert_eq!(succeed(&breaker).unwrap(), "success");

        let out = exported(&registry);
        for series in [
            r#"circuit_breaker_calls_total{breaker="payments",outcome="failure"} 1"#,
            r#"circuit_breaker_calls_total{breaker="payments",outcome="success"} 1"#,
            r#"circuit_breaker_rejections_total{breaker="payments",reason="circuit-open"} 1"#,
            r#"circuit_breaker_transitions_total{breaker="payments",from="closed",to="open"} 1"#,
            r#"circuit_breaker_transitions_total{breaker="payments",from="open",to="half-open"} 1"#,
            r#"circuit_breaker_transitions_total{breaker="payments",from="half-open",to="closed"} 1"#,
            r#"circuit_breaker_state{breaker="payments"} 0"#,
            r#"circuit_breaker_call_duration_seconds_count{breaker="payments",outcome="success"} 1"#,
        ] {
            assert_series(&out, series);
        }
    }
}

#[cfg(feature = "async")]
mod async_tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_async_circuit_breaker() {
        let clock = ManualClock::new();
        let breaker = breaker(&clock, 2, 1, 1);

        // Test successful async calls
        for _ in 0..5 {
            let result = breaker
                .call_async(|| async { Result::<String, TestError>::Ok("success".to_string()) })
                .await;
            assert_ok!(result);
        }

        // Make 2 failing calls to trip breaker
        for _ in 0..2 {
            let result = breaker
                .call_async(|| async { Result::<String, TestError>::Err(TestError::new("error")) })
                .await;
            assert!(matches!(result, Err(BreakerError::Operation(_))));
        }
        assert_eq!(breaker.current_state(), CircuitState::Open);

        // Calls should be rejected
        let result = breaker
            .call_async(|| async { Result::<String, TestError>::Ok("success".to_string()) })
            .await;
        assert!(matches!(result, Err(BreakerError::CircuitOpen { .. })));

        clock.advance(Duration::from_secs(1));
        let result = breaker
            .call_async(|| async { Result::<String, TestError>::Ok("probe".to_string()) })
            .await;
        assert_eq!(assert_ok!(result), "probe");
        assert_eq!(breaker.current_state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_timeout_discards_late_result() {
        let breaker = CircuitBreaker::builder()
            .failure_threshold(1)
            .success_threshold(1)
            .half_open_max_concurrent_probes(1)
            .call_timeout(Duration::from_millis(100))
            .build()
            .unwrap();

        let resolved = Arc::new(AtomicU32::new(0));
        let flag = Arc::clone(&resolved);
        let result = breaker
            .call_async(|| async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                flag.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TestError>("too late")
            })
            .await;

        let err = assert_err!(result);
        assert!(matches!(err, BreakerError::Timeout { limit, .. } if limit == Duration::from_millis(100)));
        assert_eq!(breaker.current_state(), CircuitState::Open);
        assert_eq!(breaker.metrics().total_timeouts, 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(resolved.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_abandoned_probe_releases_its_slot() {
        let clock = ManualClock::new();
        let breaker = breaker(&clock, 1, 1, 1);
        let _ = breaker
            .call_async(|| async { Err::<(), _>(TestError::new("down")) })
            .await;
        clock.advance(Duration::from_secs(1));

        // Start a probe, then drop it before it completes.
        {
            let probe = breaker.call_async(|| futures::future::pending::<Result<(), TestError>>());
            futures::pin_mut!(probe);
            assert!(futures::poll!(probe.as_mut()).is_pending());
            assert_eq!(breaker.state_data().half_open_in_flight, 1);
        }

        let data = breaker.state_data();
        assert_eq!(data.state, CircuitState::HalfOpen);
        assert_eq!(data.half_open_in_flight, 0);

        let result = breaker
            .call_async(|| async { Ok::<_, TestError>("recovered") })
            .await;
        assert_eq!(assert_ok!(result), "recovered");
        assert_eq!(breaker.current_state(), CircuitState::Closed);
    }

    #[test]
    fn test_async_timeout_outside_runtime_is_rejected() {
        let breaker = CircuitBreaker::builder()
            .call_timeout(Duration::from_millis(50))
            .build()
            .unwrap();

        let ran = AtomicBool::new(false);
        let result = futures::executor::block_on(breaker.call_async(|| async {
            ran.store(true, Ordering::SeqCst);
            Ok::<_, TestError>(())
        }));

        assert!(matches!(
            result,
            Err(BreakerError::Internal(InternalError::NoTimerRuntime))
        ));
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(breaker.current_state(), CircuitState::Closed);
        assert_eq!(breaker.metrics().total_short_circuited, 1);
    }
}
