use crate::cache::CacheConfig;
use crate::health::HealthThresholds;
use crate::resilience::{CircuitBreakerConfig, RateLimiterConfig, RetryPolicy};
use crate::{Error, Result};

/// Aggregate tuning surface for the gateway. Every component carries
/// sensible defaults; override what the deployment needs.
#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    pub breaker: CircuitBreakerConfig,
    pub retry: RetryPolicy,
    pub cache: CacheConfig,
    pub rate_limiter: RateLimiterConfig,
    pub health: HealthThresholds,
    /// Optional namespace mixed into cache keys.
    pub cache_salt: Option<String>,
}

impl GatewayConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_rate_limiter(mut self, rate_limiter: RateLimiterConfig) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }

    pub fn with_health(mut self, health: HealthThresholds) -> Self {
        self.health = health;
        self
    }

    pub fn with_cache_salt(mut self, salt: impl Into<String>) -> Self {
        self.cache_salt = Some(salt.into());
        self
    }

    /// Reject configurations that would make the gateway misbehave
    /// silently.
    pub fn validate(&self) -> Result<()> {
        if self.breaker.failure_threshold == 0 {
            return Err(Error::validation("breaker failure_threshold must be > 0"));
        }
        if self.breaker.success_threshold == 0 {
            return Err(Error::validation("breaker success_threshold must be > 0"));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::validation("retry max_attempts must be > 0"));
        }
        if self.retry.exponential_base < 1.0 {
            return Err(Error::validation("retry exponential_base must be >= 1.0"));
        }
        if self.cache.capacity == 0 {
            return Err(Error::validation("cache capacity must be > 0"));
        }
        if self.rate_limiter.max_requests == 0 {
            return Err(Error::validation("rate limiter max_requests must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.health.max_error_rate) {
            return Err(Error::validation(
                "health max_error_rate must be within [0, 1]",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(GatewayConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_thresholds() {
        let cfg = GatewayConfig::new()
            .with_breaker(CircuitBreakerConfig::new().with_failure_threshold(0));
        assert!(cfg.validate().is_err());

        let cfg = GatewayConfig::new().with_cache(CacheConfig::new().with_capacity(0));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_out_of_range_error_rate() {
        let cfg =
            GatewayConfig::new().with_health(HealthThresholds::new().with_max_error_rate(1.5));
        assert!(cfg.validate().is_err());
    }
}
