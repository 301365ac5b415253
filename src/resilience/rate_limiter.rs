use crate::{Error, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Maximum requests admitted per client within the window.
    pub max_requests: u32,
    /// Trailing window length.
    pub window: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window: Duration::from_secs(60),
        }
    }
}

impl RateLimiterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_requests(mut self, max: u32) -> Self {
        self.max_requests = max;
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }
}

#[derive(Debug, Default)]
struct Window {
    timestamps: VecDeque<Instant>,
}

impl Window {
    /// Drop timestamps older than the window. After this, every remaining
    /// timestamp is within `window` of now.
    fn prune(&mut self, window: Duration, now: Instant) {
        while let Some(front) = self.timestamps.front() {
            if now.duration_since(*front) >= window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Per-client sliding-window rate limiter.
///
/// Denial is advisory backpressure: it records nothing and is surfaced as
/// the distinct, retryable `RateLimited` condition with no side effects on
/// breaker or cache state. Each client has its own lock; the prune, count,
/// and append happen atomically under it so two concurrent requests cannot
/// both slip past the limit.
pub struct SlidingWindowLimiter {
    cfg: RateLimiterConfig,
    clients: RwLock<HashMap<String, Arc<Mutex<Window>>>>,
}

impl SlidingWindowLimiter {
    pub fn new(cfg: RateLimiterConfig) -> Self {
        Self {
            cfg,
            clients: RwLock::new(HashMap::new()),
        }
    }

    fn window_for(&self, client_id: &str) -> Arc<Mutex<Window>> {
        if let Ok(map) = self.clients.read() {
            if let Some(w) = map.get(client_id) {
                return Arc::clone(w);
            }
        }
        let mut map = self.clients.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            map.entry(client_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(Window::default()))),
        )
    }

    /// Admit-or-deny using the configured limits.
    pub fn check_and_record(&self, client_id: &str) -> Result<()> {
        self.check_and_record_with(client_id, self.cfg.max_requests, self.cfg.window)
    }

    /// Admit-or-deny with explicit limits. Prunes timestamps outside the
    /// trailing window, denies without recording when the remaining count
    /// has reached `max_requests`, otherwise records the current attempt.
    pub fn check_and_record_with(
        &self,
        client_id: &str,
        max_requests: u32,
        window: Duration,
    ) -> Result<()> {
        let slot = self.window_for(client_id);
        let mut w = slot.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        w.prune(window, now);

        let current = w.timestamps.len() as u32;
        if current >= max_requests {
            warn!(
                client_id,
                current, max_requests, "rate limit exceeded, denying request"
            );
            return Err(Error::RateLimited {
                client_id: client_id.to_string(),
                current,
                max_requests,
            });
        }

        w.timestamps.push_back(now);
        Ok(())
    }

    /// Number of requests currently inside a client's window. Read-only:
    /// never allocates a window for an unseen client.
    pub fn current_count(&self, client_id: &str) -> u32 {
        let slot = {
            let map = self.clients.read().unwrap_or_else(|e| e.into_inner());
            map.get(client_id).map(Arc::clone)
        };
        match slot {
            Some(slot) => {
                let mut w = slot.lock().unwrap_or_else(|e| e.into_inner());
                w.prune(self.cfg.window, Instant::now());
                w.timestamps.len() as u32
            }
            None => 0,
        }
    }

    /// Garbage-prune clients whose windows have emptied. Returns how many
    /// client entries were dropped.
    pub fn prune_idle(&self) -> usize {
        let mut map = self.clients.write().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let before = map.len();
        map.retain(|_, slot| {
            let mut w = slot.lock().unwrap_or_else(|e| e.into_inner());
            w.prune(self.cfg.window, now);
            !w.timestamps.is_empty()
        });
        let dropped = before - map.len();
        if dropped > 0 {
            debug!(dropped, "pruned idle rate-limit windows");
        }
        dropped
    }

    pub fn tracked_clients(&self) -> usize {
        self.clients.read().map(|m| m.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max: u32, window_ms: u64) -> SlidingWindowLimiter {
        SlidingWindowLimiter::new(
            RateLimiterConfig::new()
                .with_max_requests(max)
                .with_window(Duration::from_millis(window_ms)),
        )
    }

    #[test]
    fn test_admits_up_to_limit_then_denies() {
        let rl = limiter(3, 60_000);
        for _ in 0..3 {
            assert!(rl.check_and_record("client-a").is_ok());
        }
        let denied = rl.check_and_record("client-a");
        match denied {
            Err(Error::RateLimited {
                current,
                max_requests,
                ..
            }) => {
                assert_eq!(current, 3);
                assert_eq!(max_requests, 3);
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }
        // Denial records nothing.
        assert_eq!(rl.current_count("client-a"), 3);
    }

    #[test]
    fn test_clients_are_independent() {
        let rl = limiter(2, 60_000);
        assert!(rl.check_and_record("a").is_ok());
        assert!(rl.check_and_record("a").is_ok());
        assert!(rl.check_and_record("a").is_err());
        assert!(rl.check_and_record("b").is_ok());
    }

    #[test]
    fn test_window_slides() {
        let rl = limiter(2, 50);
        assert!(rl.check_and_record("a").is_ok());
        assert!(rl.check_and_record("a").is_ok());
        assert!(rl.check_and_record("a").is_err());
        std::thread::sleep(Duration::from_millis(60));
        assert!(rl.check_and_record("a").is_ok());
    }

    #[test]
    fn test_prune_idle_drops_empty_windows() {
        let rl = limiter(5, 30);
        rl.check_and_record("a").unwrap();
        rl.check_and_record("b").unwrap();
        assert_eq!(rl.tracked_clients(), 2);
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(rl.prune_idle(), 2);
        assert_eq!(rl.tracked_clients(), 0);
    }

    #[test]
    fn test_current_count_does_not_allocate_windows() {
        let rl = limiter(5, 60_000);
        assert_eq!(rl.current_count("never-seen"), 0);
        assert_eq!(rl.tracked_clients(), 0);
        rl.check_and_record("a").unwrap();
        assert_eq!(rl.current_count("a"), 1);
        assert_eq!(rl.tracked_clients(), 1);
    }

    #[test]
    fn test_concurrent_requests_cannot_exceed_limit() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let rl = Arc::new(limiter(10, 60_000));
        let admitted = Arc::new(AtomicU32::new(0));
        let mut handles = vec![];
        for _ in 0..8 {
            let rl = Arc::clone(&rl);
            let admitted = Arc::clone(&admitted);
            handles.push(std::thread::spawn(move || {
                for _ in 0..5 {
                    if rl.check_and_record("shared").is_ok() {
                        admitted.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(admitted.load(Ordering::SeqCst), 10);
    }
}
