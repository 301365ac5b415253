//! Retry with exponential backoff.
//!
//! The backoff calculator is a pure function; `Retrier` wraps a fallible
//! async operation with it. Only errors matching the policy's retryable
//! predicate trigger another attempt; everything else propagates
//! immediately without consuming the remaining budget.

use crate::{Error, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

/// Compute the delay before attempt `attempt + 1` (0-indexed).
///
/// `delay = min(initial_delay * base^attempt, max_delay)`; with jitter the
/// result is scaled by a uniform factor in `[0.5, 1.0]` to avoid
/// synchronized retry storms.
pub fn backoff_delay(
    attempt: u32,
    initial_delay: Duration,
    exponential_base: f64,
    max_delay: Duration,
    jitter: bool,
) -> Duration {
    let exp = exponential_base.powi(attempt as i32);
    let raw = initial_delay.as_secs_f64() * exp;
    let capped = raw.min(max_delay.as_secs_f64());
    let final_secs = if jitter {
        capped * (0.5 + rand::thread_rng().gen::<f64>() * 0.5)
    } else {
        capped
    };
    Duration::from_secs_f64(final_secs)
}

/// Immutable retry policy, attached to a call site rather than to call state.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    pub jitter: bool,
    /// Which errors are worth another attempt. Defaults to
    /// [`Error::is_retryable`], which excludes circuit-open, rate-limited,
    /// and validation errors.
    pub retry_on: fn(&Error) -> bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter: true,
            retry_on: Error::is_retryable,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_exponential_base(mut self, base: f64) -> Self {
        self.exponential_base = base;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_retry_on(mut self, predicate: fn(&Error) -> bool) -> Self {
        self.retry_on = predicate;
        self
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        backoff_delay(
            attempt,
            self.initial_delay,
            self.exponential_base,
            self.max_delay,
            self.jitter,
        )
    }
}

/// Reusable retry handler with configurable backoff.
#[derive(Debug, Clone, Default)]
pub struct Retrier {
    policy: RetryPolicy,
}

impl Retrier {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute `op` with up to `max_attempts` attempts.
    ///
    /// Non-retryable errors propagate immediately. After the final failed
    /// attempt there is no sleep; the caller receives `RetryExhausted`
    /// wrapping the last underlying error. The inter-attempt sleep is a
    /// plain tokio sleep, so an outer timeout can cancel the whole loop.
    pub async fn call<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max = self.policy.max_attempts.max(1);
        let mut last: Option<Error> = None;

        for attempt in 0..max {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if !(self.policy.retry_on)(&e) {
                        return Err(e);
                    }
                    if attempt + 1 < max {
                        let delay = self.policy.delay_for_attempt(attempt);
                        warn!(
                            attempt = attempt + 1,
                            max_attempts = max,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "attempt failed, backing off"
                        );
                        last = Some(e);
                        tokio::time::sleep(delay).await;
                    } else {
                        error!(attempts = max, error = %e, "retry budget exhausted");
                        last = Some(e);
                    }
                }
            }
        }

        Err(Error::RetryExhausted {
            attempts: max,
            last: Box::new(last.unwrap_or_else(|| Error::runtime("retry loop without attempts"))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new()
            .with_max_attempts(3)
            .with_initial_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(5))
            .with_jitter(false)
    }

    #[test]
    fn test_backoff_deterministic_without_jitter() {
        let initial = Duration::from_secs(1);
        let max = Duration::from_secs(60);
        let d = |a| backoff_delay(a, initial, 2.0, max, false).as_secs_f64();
        assert_eq!(d(0), 1.0);
        assert_eq!(d(1), 2.0);
        assert_eq!(d(2), 4.0);
        assert_eq!(d(3), 8.0);
        // Capped at max_delay thereafter.
        assert_eq!(d(10), 60.0);
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let initial = Duration::from_secs(2);
        let max = Duration::from_secs(60);
        for _ in 0..100 {
            let d = backoff_delay(1, initial, 2.0, max, true).as_secs_f64();
            // base delay for attempt 1 is 4.0s; jitter keeps it in [2.0, 4.0]
            assert!(d >= 2.0 && d <= 4.0, "jittered delay {} out of bounds", d);
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let retrier = Retrier::new(fast_policy());
        let c = Arc::clone(&count);
        let result = retrier
            .call(|| {
                let c = Arc::clone(&c);
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Error::transient("flaky"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_wraps_last_error() {
        let retrier = Retrier::new(fast_policy());
        let result: Result<()> = retrier.call(|| async { Err(Error::transient("down")) }).await;
        match result {
            Err(Error::RetryExhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, Error::Transient { .. }));
            }
            other => panic!("expected RetryExhausted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_retryable_propagates_immediately() {
        let count = Arc::new(AtomicU32::new(0));
        let retrier = Retrier::new(fast_policy());
        let c = Arc::clone(&count);
        let result: Result<()> = retrier
            .call(|| {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(Error::validation("malformed"))
                }
            })
            .await;
        assert!(matches!(result, Err(Error::Validation { .. })));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_circuit_open_is_not_retried() {
        let count = Arc::new(AtomicU32::new(0));
        let retrier = Retrier::new(fast_policy());
        let c = Arc::clone(&count);
        let result: Result<()> = retrier
            .call(|| {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(Error::CircuitOpen {
                        dependency: "model".into(),
                        retry_after_ms: 100,
                    })
                }
            })
            .await;
        assert!(matches!(result, Err(Error::CircuitOpen { .. })));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_custom_predicate() {
        let policy = fast_policy().with_retry_on(|_| true);
        let retrier = Retrier::new(policy);
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        let result: Result<()> = retrier
            .call(|| {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(Error::validation("still retried"))
                }
            })
            .await;
        assert!(matches!(result, Err(Error::RetryExhausted { .. })));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
