pub mod memory;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub use memory::MemoryCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("cache not found")]
    NotFound,

    #[error("invalid TTL provided")]
    InvalidTtl,

    #[error("failed to add key/value to cache")]
    AddFailed,

    #[error("invalid max size provided for cache")]
    InvalidMaxSize,
}

/// Generic keyed store with per-entry expiry.
///
/// A miss is always possible, even right after a successful `set`, so callers
/// must never treat the absence of a value as meaningful.
#[async_trait]
pub trait Cache<T>: Send + Sync
where
    T: Clone + Send + Sync + 'static,
{
    /// Return the value stored under `key` if it is present and unexpired.
    async fn get(&self, key: &str) -> Result<T, CacheError>;

    /// Store `value` under `key`. A zero `ttl` selects the cache default.
    /// `AddFailed` means admission was refused; the caller keeps its value
    /// uncached.
    async fn set(&self, key: &str, value: T, ttl: Duration) -> Result<(), CacheError>;

    /// Remove `key`. Concurrent readers may still briefly observe the old
    /// value.
    async fn delete(&self, key: &str);
}
