//! Bounded pooling of reusable backend connections.
//!
//! A semaphore caps how many connections are out or being created at once;
//! released connections go back to an idle list for the next caller. The
//! caller decides what a "connection" is by supplying the factory.

use crate::{Error, Result};
use serde::Serialize;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::debug;

type ConnFuture<C> = Pin<Box<dyn Future<Output = Result<C>> + Send>>;
type ConnFactory<C> = Arc<dyn Fn() -> ConnFuture<C> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Hard cap on connections alive at once.
    pub max_size: usize,
    /// Connections `warm` pre-creates.
    pub min_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            min_size: 2,
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_size(mut self, max: usize) -> Self {
        self.max_size = max;
        self
    }

    pub fn with_min_size(mut self, min: usize) -> Self {
        self.min_size = min;
        self
    }
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct PoolStats {
    /// Connections built by the factory over the pool's lifetime.
    pub created: u64,
    /// Acquisitions served from the idle list.
    pub reused: u64,
}

/// Connection pool with a fixed upper bound.
///
/// `acquire` waits when `max_size` connections are already out, so the
/// backend never sees more than the configured concurrency.
pub struct ConnectionPool<C> {
    cfg: PoolConfig,
    factory: ConnFactory<C>,
    idle: Mutex<Vec<C>>,
    permits: Semaphore,
    created: AtomicU64,
    reused: AtomicU64,
}

impl<C: Send + 'static> ConnectionPool<C> {
    pub fn new<F, Fut>(cfg: PoolConfig, factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<C>> + Send + 'static,
    {
        let permits = Semaphore::new(cfg.max_size);
        Self {
            cfg,
            factory: Arc::new(move || Box::pin(factory())),
            idle: Mutex::new(Vec::new()),
            permits,
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
        }
    }

    /// Check out a connection, waiting if the pool is exhausted.
    ///
    /// An idle connection is reused when one exists; otherwise the factory
    /// builds a fresh one. A factory failure surfaces to this caller and
    /// frees the slot for the next.
    pub async fn acquire(&self) -> Result<PooledConn<'_, C>> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| Error::runtime("connection pool is closed"))?;

        let idle = {
            let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
            idle.pop()
        };
        let conn = match idle {
            Some(conn) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                conn
            }
            None => {
                let conn = (self.factory)().await?;
                self.created.fetch_add(1, Ordering::Relaxed);
                debug!("created pooled connection");
                conn
            }
        };

        Ok(PooledConn {
            pool: self,
            conn: Some(conn),
            _permit: permit,
        })
    }

    /// Pre-create connections up to `min_size`. Returns how many were built.
    pub async fn warm(&self) -> Result<usize> {
        let mut built = 0;
        loop {
            {
                let idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
                if idle.len() >= self.cfg.min_size {
                    return Ok(built);
                }
            }
            let conn = (self.factory)().await?;
            self.created.fetch_add(1, Ordering::Relaxed);
            built += 1;
            let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
            idle.push(conn);
        }
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.created.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
        }
    }

    fn put_back(&self, conn: C) {
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        idle.push(conn);
    }
}

/// Checked-out connection. Dropping it returns the connection to the pool;
/// `discard` destroys it instead, for connections a caller found broken.
pub struct PooledConn<'a, C: Send + 'static> {
    pool: &'a ConnectionPool<C>,
    conn: Option<C>,
    _permit: SemaphorePermit<'a>,
}

impl<C: Send + 'static> PooledConn<'_, C> {
    /// Drop the connection instead of returning it. The pool slot frees
    /// either way.
    pub fn discard(mut self) {
        self.conn = None;
    }
}

impl<C: Send + 'static> Deref for PooledConn<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl<C: Send + 'static> DerefMut for PooledConn<'_, C> {
    fn deref_mut(&mut self) -> &mut C {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl<C: Send + 'static> Drop for PooledConn<'_, C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put_back(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn counting_pool(cfg: PoolConfig) -> ConnectionPool<u32> {
        let seq = AtomicU32::new(0);
        ConnectionPool::new(cfg, move || {
            let id = seq.fetch_add(1, Ordering::SeqCst);
            async move { Ok(id) }
        })
    }

    #[tokio::test]
    async fn test_released_connection_is_reused() {
        let pool = counting_pool(PoolConfig::new().with_max_size(4));

        let first = pool.acquire().await.unwrap();
        let id = *first;
        drop(first);

        let second = pool.acquire().await.unwrap();
        assert_eq!(*second, id);
        let stats = pool.stats();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.reused, 1);
    }

    #[tokio::test]
    async fn test_pool_caps_concurrent_checkouts() {
        let pool = Arc::new(counting_pool(PoolConfig::new().with_max_size(1)));

        let held = pool.acquire().await.unwrap();
        let p = Arc::clone(&pool);
        let blocked = tokio::spawn(async move {
            let conn = p.acquire().await.unwrap();
            *conn
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        drop(held);
        // Releasing unblocks the waiter with the recycled connection.
        assert_eq!(blocked.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_factory_failure_frees_the_slot() {
        let attempts = AtomicU32::new(0);
        let pool: ConnectionPool<u32> =
            ConnectionPool::new(PoolConfig::new().with_max_size(1), move || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(Error::transient("backend refused"))
                    } else {
                        Ok(n)
                    }
                }
            });

        assert!(pool.acquire().await.is_err());
        // The failed attempt must not leak its permit.
        let conn = pool.acquire().await.unwrap();
        assert_eq!(*conn, 1);
    }

    #[tokio::test]
    async fn test_discard_drops_broken_connection() {
        let pool = counting_pool(PoolConfig::new().with_max_size(2));

        let conn = pool.acquire().await.unwrap();
        conn.discard();
        assert_eq!(pool.idle_count(), 0);

        // Next checkout builds a fresh connection.
        let fresh = pool.acquire().await.unwrap();
        assert_eq!(*fresh, 1);
        assert_eq!(pool.stats().created, 2);
    }

    #[tokio::test]
    async fn test_warm_builds_up_to_min_size() {
        let pool = counting_pool(PoolConfig::new().with_max_size(8).with_min_size(3));
        assert_eq!(pool.warm().await.unwrap(), 3);
        assert_eq!(pool.idle_count(), 3);
        // Warming again is a no-op.
        assert_eq!(pool.warm().await.unwrap(), 0);
    }
}
