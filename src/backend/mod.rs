//! Key-value store backends.
//!
//! The loader needs four primitives from the store: `get`, TTL-qualified
//! `set`, atomic `set_if_absent`, and `delete`. Any store offering them can
//! back the cache.

use crate::error::Result;
use std::future::Future;
use std::time::Duration;

#[cfg(feature = "inmemory")]
mod inmemory;
#[cfg(feature = "memcached")]
mod memcached;
#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "inmemory")]
pub use inmemory::InMemoryBackend;
#[cfg(feature = "memcached")]
pub use memcached::{MemcachedBackend, MemcachedConfig};
#[cfg(feature = "redis")]
pub use self::redis::{RedisBackend, RedisConfig};

/// Abstraction over a shared, TTL-capable key-value store.
///
/// Backends are cheap handles (connection pools, `Arc`s): the lock guard and
/// rebuild jobs clone them to outlive the request that created them.
///
/// Transport failures must surface as `Error::StoreUnavailable`.
pub trait CacheBackend: Clone + Send + Sync + 'static {
    /// Read a value. `None` if absent or physically expired.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send;

    /// Write a value, replacing any existing one. `None` TTL means no expiry.
    fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Write only if the key is absent, in a single atomic operation.
    ///
    /// Returns `true` if this call created the key.
    fn set_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Remove a key. Deleting an absent key is not an error.
    fn delete(&self, key: &str) -> impl Future<Output = Result<()>> + Send;

    /// Check that the store is reachable.
    fn health_check(&self) -> impl Future<Output = Result<bool>> + Send {
        async { Ok(true) }
    }
}
