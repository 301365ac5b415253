//! Micro-batching for backends that prefer vectorized calls.
//!
//! Submitters queue individual items; a batch is dispatched to the handler
//! as soon as it fills, or when the oldest waiter has been queued for the
//! configured wait. Every submitter receives its own slice of the batch
//! outcome.

use crate::{Error, Result};
use serde::Serialize;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

type BatchFuture<O> = Pin<Box<dyn Future<Output = Result<Vec<O>>> + Send>>;
type BatchHandler<I, O> = Arc<dyn Fn(Vec<I>) -> BatchFuture<O> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Queue length that triggers an immediate dispatch.
    pub max_batch_size: usize,
    /// Longest a queued item waits before a partial batch is dispatched.
    pub max_wait: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 32,
            max_wait: Duration::from_millis(100),
        }
    }
}

impl BatchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    pub fn with_max_wait(mut self, wait: Duration) -> Self {
        self.max_wait = wait;
        self
    }
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct BatchStats {
    /// Handler invocations.
    pub batches: u64,
    /// Items dispatched across all batches.
    pub items: u64,
}

struct Pending<I, O> {
    item: I,
    tx: oneshot::Sender<Result<O>>,
}

/// Groups individually submitted items into handler calls.
///
/// The handler receives the batched inputs and must return one output per
/// input, in order. A handler error is delivered to every submitter in the
/// batch.
pub struct BatchProcessor<I, O> {
    cfg: BatchConfig,
    handler: BatchHandler<I, O>,
    queue: Mutex<Vec<Pending<I, O>>>,
    batches: AtomicU64,
    items: AtomicU64,
}

impl<I: Send + 'static, O: Clone + Send + 'static> BatchProcessor<I, O> {
    pub fn new<F, Fut>(cfg: BatchConfig, handler: F) -> Self
    where
        F: Fn(Vec<I>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<O>>> + Send + 'static,
    {
        Self {
            cfg,
            handler: Arc::new(move |items| Box::pin(handler(items))),
            queue: Mutex::new(Vec::new()),
            batches: AtomicU64::new(0),
            items: AtomicU64::new(0),
        }
    }

    /// Submit one item and wait for its slice of the batch outcome.
    ///
    /// The submitter that fills the batch dispatches it inline. Everyone
    /// else waits; whoever times out first dispatches the partial batch,
    /// so no item waits longer than `max_wait` plus one handler call.
    pub async fn submit(&self, item: I) -> Result<O> {
        let (tx, mut rx) = oneshot::channel();
        let full = {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.push(Pending { item, tx });
            queue.len() >= self.cfg.max_batch_size
        };

        if full {
            self.flush().await;
        } else {
            match tokio::time::timeout(self.cfg.max_wait, &mut rx).await {
                Ok(Ok(outcome)) => return outcome,
                Ok(Err(_)) => return Err(Error::runtime("batch was dropped before completing")),
                // Still queued past the deadline; dispatch whatever is there.
                Err(_) => self.flush().await,
            }
        }

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::runtime("batch was dropped before completing")),
        }
    }

    /// Dispatch every queued item now. A no-op on an empty queue.
    pub async fn flush(&self) {
        let pending = {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            mem::take(&mut *queue)
        };
        if pending.is_empty() {
            return;
        }

        let count = pending.len();
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.items.fetch_add(count as u64, Ordering::Relaxed);
        debug!(count, "dispatching batch");

        let (items, senders): (Vec<I>, Vec<oneshot::Sender<Result<O>>>) =
            pending.into_iter().map(|p| (p.item, p.tx)).unzip();

        match (self.handler)(items).await {
            Ok(outputs) if outputs.len() == count => {
                for (tx, output) in senders.into_iter().zip(outputs) {
                    let _ = tx.send(Ok(output));
                }
            }
            Ok(outputs) => {
                let err = Error::runtime(format!(
                    "batch handler returned {} outputs for {} inputs",
                    outputs.len(),
                    count
                ));
                for tx in senders {
                    let _ = tx.send(Err(err.clone()));
                }
            }
            Err(e) => {
                for tx in senders {
                    let _ = tx.send(Err(e.clone()));
                }
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn stats(&self) -> BatchStats {
        BatchStats {
            batches: self.batches.load(Ordering::Relaxed),
            items: self.items.load(Ordering::Relaxed),
        }
    }
}
