//! In-process backend for tests, demos and single-node deployments.

use super::CacheBackend;
use crate::error::Result;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Clone)]
struct StoredValue {
    data: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn new(data: Vec<u8>, ttl: Option<Duration>) -> Self {
        StoredValue {
            data,
            expires_at: ttl.map(|d| Instant::now() + d),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Thread-safe in-memory store with lazy TTL expiry.
///
/// Clones share the same underlying map.
///
/// # Example
///
/// ```
/// # use cache_shield::backend::{CacheBackend, InMemoryBackend};
/// # use std::time::Duration;
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> cache_shield::Result<()> {
/// let backend = InMemoryBackend::new();
/// assert!(backend.set_if_absent("lock:shop:1", b"1".to_vec(), Duration::from_secs(10)).await?);
/// assert!(!backend.set_if_absent("lock:shop:1", b"1".to_vec(), Duration::from_secs(10)).await?);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    store: Arc<DashMap<String, StoredValue>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        InMemoryBackend {
            store: Arc::new(DashMap::new()),
        }
    }

    /// Number of live (unexpired) keys.
    pub async fn len(&self) -> usize {
        self.store.iter().filter(|e| !e.value().is_expired()).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Remaining physical TTL. `None` if the key is absent or has no expiry.
    pub fn ttl_remaining(&self, key: &str) -> Option<Duration> {
        let entry = self.store.get(key)?;
        let at = entry.expires_at?;
        at.checked_duration_since(Instant::now())
    }

    pub fn clear(&self) {
        self.store.clear();
    }
}

impl CacheBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let expired = match self.store.get(key) {
            Some(value) if !value.is_expired() => {
                debug!("✓ InMemory GET {} -> HIT", key);
                return Ok(Some(value.data.clone()));
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            self.store.remove_if(key, |_, v| v.is_expired());
        }
        debug!("✓ InMemory GET {} -> MISS", key);
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        self.store
            .insert(key.to_string(), StoredValue::new(value, ttl));
        debug!("✓ InMemory SET {} (TTL: {:?})", key, ttl);
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool> {
        let created = match self.store.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(StoredValue::new(value, Some(ttl)));
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredValue::new(value, Some(ttl)));
                true
            }
        };
        debug!("✓ InMemory SETNX {} -> {}", key, created);
        Ok(created)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.store.remove(key);
        debug!("✓ InMemory DELETE {}", key);
        Ok(())
    }
}
