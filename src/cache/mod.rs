//! Prediction result caching: deterministic request keys plus a bounded
//! LRU store with per-entry TTL.

pub mod key;
pub mod lru;

pub use key::KeyGenerator;
pub use lru::{CacheConfig, CacheStats, LruTtlCache};
