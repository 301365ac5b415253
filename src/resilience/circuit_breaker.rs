use crate::{Error, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Breaker states.
///
/// - `Closed`: normal operation, requests pass through
/// - `Open`: failure threshold reached, requests fail fast
/// - `HalfOpen`: cooldown elapsed, probing for recovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it again.
    pub success_threshold: u32,
    /// How long the circuit stays open before probing.
    pub recovery_timeout: Duration,
    /// Optional bound on a single wrapped call; exceeding it counts as a failure.
    pub call_timeout: Option<Duration>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
            call_timeout: None,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure threshold
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the number of half-open successes required to close
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    /// Set the open-state cooldown
    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    /// Bound each wrapped call attempt
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }
}

/// Read-only snapshot of a breaker, suitable for readiness reporting.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub dependency: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    /// Remaining open time in ms; zero unless currently open.
    pub time_until_retry_ms: u64,
}

#[derive(Debug)]
struct State {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
}

impl State {
    fn transition(&mut self, to: CircuitState) {
        // Counters are only meaningful within the current state.
        self.state = to;
        self.failure_count = 0;
        self.success_count = 0;
    }
}

/// Per-dependency circuit breaker.
///
/// Counts consecutive failures while closed; opens for `recovery_timeout`
/// once the threshold is reached; probes in half-open until
/// `success_threshold` consecutive successes close it again. A single
/// half-open failure reopens immediately.
pub struct CircuitBreaker {
    name: String,
    cfg: CircuitBreakerConfig,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, cfg: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            cfg,
            state: Mutex::new(State {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_time: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>> {
        self.state.lock().map_err(|_| {
            Error::runtime_with_context(
                "circuit breaker lock poisoned",
                crate::ErrorContext::new().with_source("circuit_breaker"),
            )
        })
    }

    /// Gate check. Moves Open → HalfOpen once the cooldown has elapsed;
    /// otherwise fails fast with `CircuitOpen` without touching counters.
    pub fn allow(&self) -> Result<()> {
        let mut st = self.lock()?;
        if st.state == CircuitState::Open {
            let elapsed = st
                .last_failure_time
                .map(|t| t.elapsed())
                .unwrap_or(self.cfg.recovery_timeout);
            if elapsed >= self.cfg.recovery_timeout {
                st.transition(CircuitState::HalfOpen);
                info!(dependency = self.name.as_str(), "circuit breaker half-open");
            } else {
                let remaining = self.cfg.recovery_timeout - elapsed;
                return Err(Error::CircuitOpen {
                    dependency: self.name.clone(),
                    retry_after_ms: remaining.as_millis() as u64,
                });
            }
        }
        Ok(())
    }

    /// Record a successful call outcome.
    pub fn on_success(&self) {
        if let Ok(mut st) = self.lock() {
            match st.state {
                CircuitState::HalfOpen => {
                    st.success_count += 1;
                    debug!(
                        dependency = self.name.as_str(),
                        successes = st.success_count,
                        needed = self.cfg.success_threshold,
                        "half-open success"
                    );
                    if st.success_count >= self.cfg.success_threshold {
                        st.transition(CircuitState::Closed);
                        info!(
                            dependency = self.name.as_str(),
                            "circuit breaker closed, dependency recovered"
                        );
                    }
                }
                CircuitState::Closed => {
                    // Full reset, not decrement.
                    st.failure_count = 0;
                }
                CircuitState::Open => {}
            }
        }
    }

    /// Record a failed call outcome.
    pub fn on_failure(&self) {
        if let Ok(mut st) = self.lock() {
            st.last_failure_time = Some(Instant::now());
            match st.state {
                CircuitState::HalfOpen => {
                    // Any failure while probing reopens.
                    st.transition(CircuitState::Open);
                    st.last_failure_time = Some(Instant::now());
                    warn!(
                        dependency = self.name.as_str(),
                        "circuit breaker reopened from half-open"
                    );
                }
                CircuitState::Closed => {
                    st.failure_count = st.failure_count.saturating_add(1);
                    if st.failure_count >= self.cfg.failure_threshold {
                        let failures = st.failure_count;
                        st.transition(CircuitState::Open);
                        st.last_failure_time = Some(Instant::now());
                        warn!(
                            dependency = self.name.as_str(),
                            failures,
                            cooldown_ms = self.cfg.recovery_timeout.as_millis() as u64,
                            "circuit breaker opened"
                        );
                    }
                }
                CircuitState::Open => {}
            }
        }
    }

    /// Execute `op` through the breaker: gate, run (bounded by
    /// `call_timeout` when configured), record the outcome.
    ///
    /// Errors that do not count against the breaker (validation, rate-limit,
    /// nested circuit-open) pass through without touching the failure count.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.allow()?;

        let result = match self.cfg.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, op()).await {
                Ok(r) => r,
                Err(_) => Err(Error::Timeout {
                    dependency: self.name.clone(),
                    elapsed_ms: limit.as_millis() as u64,
                }),
            },
            None => op().await,
        };

        match &result {
            Ok(_) => self.on_success(),
            Err(e) if e.counts_against_breaker() => self.on_failure(),
            Err(_) => {}
        }
        result
    }

    /// Read-only snapshot: state, counts, time remaining until a retry is
    /// possible.
    pub fn status(&self) -> BreakerStatus {
        let (state, failure_count, success_count, time_until_retry_ms) = match self.lock() {
            Ok(st) => {
                let remaining = if st.state == CircuitState::Open {
                    st.last_failure_time
                        .map(|t| {
                            self.cfg
                                .recovery_timeout
                                .saturating_sub(t.elapsed())
                                .as_millis() as u64
                        })
                        .unwrap_or(0)
                } else {
                    0
                };
                (st.state, st.failure_count, st.success_count, remaining)
            }
            Err(_) => (CircuitState::Closed, 0, 0, 0),
        };
        BreakerStatus {
            dependency: self.name.clone(),
            state,
            failure_count,
            success_count,
            time_until_retry_ms,
        }
    }

    /// Operator override: force Closed with zeroed counters. Idempotent.
    pub fn reset(&self) {
        if let Ok(mut st) = self.lock() {
            st.transition(CircuitState::Closed);
            st.last_failure_time = None;
            info!(dependency = self.name.as_str(), "circuit breaker reset");
        }
    }
}

/// Injectable name → breaker registry so that multiple call sites for the
/// same dependency share state. Owned by the gateway rather than living in
/// process-global statics, so tests can construct isolated instances.
pub struct BreakerRegistry {
    default_cfg: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(default_cfg: CircuitBreakerConfig) -> Self {
        Self {
            default_cfg,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Get or create the breaker for a dependency name. Each breaker has its
    /// own lock, so breakers for different names never contend.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Ok(map) = self.breakers.read() {
            if let Some(b) = map.get(name) {
                return Arc::clone(b);
            }
        }
        let mut map = self.breakers.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            map.entry(name.to_string()).or_insert_with(|| {
                Arc::new(CircuitBreaker::new(name, self.default_cfg.clone()))
            }),
        )
    }

    /// Snapshot every registered breaker.
    pub fn all_statuses(&self) -> HashMap<String, BreakerStatus> {
        match self.breakers.read() {
            Ok(map) => map
                .iter()
                .map(|(name, b)| (name.clone(), b.status()))
                .collect(),
            Err(_) => HashMap::new(),
        }
    }

    /// Force every registered breaker closed.
    pub fn reset_all(&self) {
        if let Ok(map) = self.breakers.read() {
            for b in map.values() {
                b.reset();
            }
        }
        info!("all circuit breakers reset");
    }
}
