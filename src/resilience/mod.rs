//! Failure-containment primitives: circuit breaking, bounded retries with
//! exponential backoff, and per-client sliding-window rate limiting.

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;

pub use circuit_breaker::{
    BreakerRegistry, BreakerStatus, CircuitBreaker, CircuitBreakerConfig, CircuitState,
};
pub use rate_limiter::{RateLimiterConfig, SlidingWindowLimiter};
pub use retry::{backoff_delay, Retrier, RetryPolicy};
