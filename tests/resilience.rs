//! Composition tests for retry wrapped around a circuit breaker, the
//! nesting the gateway uses on its prediction path.

use modelgate::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState, Retrier, RetryPolicy};
use modelgate::Error;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn fast_retry(attempts: u32) -> Retrier {
    Retrier::new(
        RetryPolicy::new()
            .with_max_attempts(attempts)
            .with_initial_delay(Duration::from_millis(1))
            .with_jitter(false),
    )
}

#[tokio::test]
async fn test_retries_do_not_bypass_open_breaker() {
    let breaker = Arc::new(CircuitBreaker::new(
        "dep",
        CircuitBreakerConfig::new()
            .with_failure_threshold(2)
            .with_recovery_timeout(Duration::from_secs(60)),
    ));
    let retrier = fast_retry(5);
    let calls = Arc::new(AtomicU32::new(0));

    let result = retrier
        .call(|| {
            let breaker = Arc::clone(&breaker);
            let calls = Arc::clone(&calls);
            async move {
                breaker
                    .call(|| async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(Error::transient("down"))
                    })
                    .await
            }
        })
        .await;

    // Two attempts trip the breaker; the third is gated and, being
    // non-retryable, ends the loop. The operation never runs a third time.
    assert!(result.unwrap_err().is_circuit_open());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(breaker.status().state, CircuitState::Open);
}

#[tokio::test]
async fn test_timeouts_count_toward_opening() {
    let breaker = Arc::new(CircuitBreaker::new(
        "slow-dep",
        CircuitBreakerConfig::new()
            .with_failure_threshold(2)
            .with_call_timeout(Duration::from_millis(10)),
    ));
    let retrier = fast_retry(3);

    let result = retrier
        .call(|| {
            let breaker = Arc::clone(&breaker);
            async move {
                breaker
                    .call(|| async {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        Ok::<(), Error>(())
                    })
                    .await
            }
        })
        .await;

    assert!(result.unwrap_err().is_circuit_open());
    assert_eq!(breaker.status().state, CircuitState::Open);
}

#[tokio::test]
async fn test_recovery_probe_closes_breaker_through_retry_path() {
    let breaker = Arc::new(CircuitBreaker::new(
        "dep",
        CircuitBreakerConfig::new()
            .with_failure_threshold(1)
            .with_success_threshold(2)
            .with_recovery_timeout(Duration::from_millis(30)),
    ));

    breaker
        .call(|| async { Err::<(), _>(Error::transient("down")) })
        .await
        .unwrap_err();
    assert_eq!(breaker.status().state, CircuitState::Open);

    tokio::time::sleep(Duration::from_millis(40)).await;

    // Probes succeed; after success_threshold of them the breaker closes.
    for _ in 0..2 {
        breaker.call(|| async { Ok::<_, Error>(1) }).await.unwrap();
    }
    assert_eq!(breaker.status().state, CircuitState::Closed);
    assert_eq!(breaker.status().failure_count, 0);
}

#[tokio::test]
async fn test_validation_errors_pass_through_untouched() {
    let breaker = Arc::new(CircuitBreaker::new(
        "dep",
        CircuitBreakerConfig::new().with_failure_threshold(1),
    ));
    let retrier = fast_retry(3);
    let calls = Arc::new(AtomicU32::new(0));

    let result = retrier
        .call(|| {
            let breaker = Arc::clone(&breaker);
            let calls = Arc::clone(&calls);
            async move {
                breaker
                    .call(|| async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(Error::validation("bad input"))
                    })
                    .await
            }
        })
        .await;

    // Not retried, and the breaker stays closed with a zero failure count.
    assert!(matches!(result, Err(Error::Validation { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let status = breaker.status();
    assert_eq!(status.state, CircuitState::Closed);
    assert_eq!(status.failure_count, 0);
}
