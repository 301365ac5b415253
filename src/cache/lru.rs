use serde::Serialize;
use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of live entries before insertion evicts.
    pub capacity: usize,
    /// Lifetime applied when `set` is called without an override.
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            default_ttl: Duration::from_secs(300),
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }
}

/// Point-in-time counters. `expired` counts entries removed because their
/// TTL lapsed, `evictions` counts capacity-pressure removals only.
#[derive(Debug, Clone, Serialize, Default)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Entry<V> {
    value: V,
    expires_at: Instant,
    /// Recency stamp from a monotonic counter. Strictly increasing per
    /// touch, so no two entries tie.
    touched: u64,
}

struct Inner<K, V> {
    entries: HashMap<K, Entry<V>>,
    clock: u64,
}

/// Bounded cache with LRU eviction and per-entry TTL.
///
/// Expiry is lazy: an entry past its deadline is removed on the `get`
/// that observes it (counted as a miss) or by `cleanup_expired`. When an
/// insert would exceed capacity, exactly the least-recently-used live
/// entry is evicted first.
pub struct LruTtlCache<K, V> {
    cfg: CacheConfig,
    inner: Mutex<Inner<K, V>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expired: AtomicU64,
}

impl<K: Hash + Eq + Clone, V: Clone> LruTtlCache<K, V> {
    pub fn new(cfg: CacheConfig) -> Self {
        Self {
            cfg,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                clock: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        match inner.entries.get(key) {
            Some(entry) if entry.expires_at <= now => {
                inner.entries.remove(key);
                self.expired.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Some(_) => {
                inner.clock += 1;
                let clock = inner.clock;
                match inner.entries.get_mut(key) {
                    Some(entry) => {
                        entry.touched = clock;
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        Some(entry.value.clone())
                    }
                    None => None,
                }
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn set(&self, key: impl Into<K>, value: V) {
        self.set_with_ttl(key, value, self.cfg.default_ttl);
    }

    pub fn set_with_ttl(&self, key: impl Into<K>, value: V, ttl: Duration) {
        let key = key.into();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();

        // Overwriting an existing key never triggers eviction.
        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.cfg.capacity {
            // Prefer reclaiming an expired slot over evicting a live one.
            let dead: Option<K> = inner
                .entries
                .iter()
                .find(|(_, e)| e.expires_at <= now)
                .map(|(k, _)| k.clone());
            if let Some(k) = dead {
                inner.entries.remove(&k);
                self.expired.fetch_add(1, Ordering::Relaxed);
            } else if let Some(lru) = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.touched)
                .map(|(k, _)| k.clone())
            {
                debug!("evicting least-recently-used cache entry");
                inner.entries.remove(&lru);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        inner.clock += 1;
        let touched = inner.clock;
        inner.entries.insert(
            key,
            Entry {
                value,
                expires_at: now + ttl,
                touched,
            },
        );
    }

    pub fn remove<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.remove(key).is_some()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.clear();
    }

    /// Sweep out every expired entry. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let before = inner.entries.len();
        inner.entries.retain(|_, e| e.expires_at > now);
        let removed = before - inner.entries.len();
        if removed > 0 {
            self.expired.fetch_add(removed as u64, Ordering::Relaxed);
            debug!(removed, "swept expired cache entries");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.len(),
            capacity: self.cfg.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
        }
    }
}
