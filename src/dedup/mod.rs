//! Single-flight request coalescing.
//!
//! Concurrent calls that share a key execute the underlying operation once;
//! every other caller waits on the owner's published outcome, success or
//! failure alike.

use crate::{Error, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::watch;
use tracing::debug;

type Slot<T> = watch::Receiver<Option<Result<T>>>;

#[derive(Debug, Clone, Serialize, Default)]
pub struct DedupStats {
    /// Operations actually executed (one per in-flight key).
    pub executed: u64,
    /// Callers that coalesced onto an in-flight operation.
    pub coalesced: u64,
}

pub struct Deduplicator<T: Clone> {
    inflight: Mutex<HashMap<String, Slot<T>>>,
    executed: AtomicU64,
    coalesced: AtomicU64,
}

impl<T: Clone> Default for Deduplicator<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes the in-flight slot when the owner finishes or is cancelled.
/// Publication happens before removal, so late waiters either join the
/// slot and see the outcome or miss it and start a fresh flight.
struct FlightGuard<'a, T: Clone> {
    dedup: &'a Deduplicator<T>,
    key: String,
    tx: watch::Sender<Option<Result<T>>>,
    published: bool,
}

impl<T: Clone> Drop for FlightGuard<'_, T> {
    fn drop(&mut self) {
        if !self.published {
            let _ = self.tx.send(Some(Err(Error::runtime(
                "deduplicated operation was cancelled before completing",
            ))));
        }
        let mut map = self
            .dedup
            .inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        map.remove(&self.key);
    }
}

impl<T: Clone> Deduplicator<T> {
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
            executed: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
        }
    }

    /// Run `op` for `key`, or wait for the in-flight run of the same key.
    ///
    /// The owner executes `op` and publishes its outcome to all waiters;
    /// waiters receive a clone of exactly that outcome. If the owner is
    /// cancelled mid-flight, waiters get an error rather than hanging.
    pub async fn run<F, Fut>(&self, key: &str, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let claim = {
            let mut map = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(rx) = map.get(key) {
                Err(rx.clone())
            } else {
                let (tx, rx) = watch::channel(None);
                map.insert(key.to_string(), rx);
                Ok(tx)
            }
        };

        match claim {
            Ok(tx) => {
                self.executed.fetch_add(1, Ordering::Relaxed);
                let mut guard = FlightGuard {
                    dedup: self,
                    key: key.to_string(),
                    tx,
                    published: false,
                };
                let outcome = op().await;
                let _ = guard.tx.send(Some(outcome.clone()));
                guard.published = true;
                outcome
            }
            Err(mut rx) => {
                self.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!(key, "coalescing onto in-flight operation");
                loop {
                    if let Some(outcome) = rx.borrow_and_update().as_ref() {
                        return outcome.clone();
                    }
                    if rx.changed().await.is_err() {
                        // Sender dropped without publishing.
                        return Err(Error::runtime(
                            "deduplicated operation was cancelled before completing",
                        ));
                    }
                }
            }
        }
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn stats(&self) -> DedupStats {
        DedupStats {
            executed: self.executed.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
        }
    }
}
