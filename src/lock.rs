//! Distributed mutual exclusion on top of the store's `set_if_absent`.
//!
//! A lock is a key in the `lock:` namespace created with a lease TTL. Whoever
//! created the key holds the lock until it is deleted or the lease expires,
//! so a crashed holder blocks others for at most one lease.

use crate::backend::CacheBackend;
use crate::error::Result;
use std::time::Duration;

const LOCK_VALUE: &[u8] = b"1";

/// Non-blocking lock over a [`CacheBackend`].
#[derive(Clone)]
pub struct DistributedLock<B: CacheBackend> {
    backend: B,
}

impl<B: CacheBackend> DistributedLock<B> {
    pub fn new(backend: B) -> Self {
        DistributedLock { backend }
    }

    /// Try to take the lock once. Never waits.
    ///
    /// Returns `None` if someone else holds it.
    pub async fn try_acquire(&self, lock_key: &str, lease: Duration) -> Result<Option<LockGuard<B>>> {
        let acquired = self
            .backend
            .set_if_absent(lock_key, LOCK_VALUE.to_vec(), lease)
            .await?;

        if acquired {
            debug!("🔒 Acquired {} (lease {:?})", lock_key, lease);
            Ok(Some(LockGuard {
                backend: self.backend.clone(),
                key: lock_key.to_string(),
                released: false,
            }))
        } else {
            debug!("Lock {} is held elsewhere", lock_key);
            Ok(None)
        }
    }

    /// Delete the lock key regardless of who holds it.
    pub async fn release(&self, lock_key: &str) -> Result<()> {
        self.backend.delete(lock_key).await
    }
}

/// Ownership of an acquired lock.
///
/// Release explicitly with [`LockGuard::release`]. A guard dropped while
/// still held (early return, `?`, panic unwind, or a rebuild job that never
/// ran) schedules the delete on the current tokio runtime. Outside a
/// runtime the lease is left to expire.
///
/// Moving the guard into a background task hands the lock over to it.
#[must_use = "dropping the guard releases the lock"]
pub struct LockGuard<B: CacheBackend> {
    backend: B,
    key: String,
    released: bool,
}

impl<B: CacheBackend> LockGuard<B> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the lock now.
    ///
    /// # Errors
    ///
    /// Returns the store error if the delete failed; the lease still bounds
    /// how long the key survives.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        let result = self.backend.delete(&self.key).await;
        match &result {
            Ok(()) => debug!("🔓 Released {}", self.key),
            Err(e) => warn!("Failed to release {}: {} (lease will expire)", self.key, e),
        }
        result
    }
}

impl<B: CacheBackend> Drop for LockGuard<B> {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let key = std::mem::take(&mut self.key);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let backend = self.backend.clone();
                handle.spawn(async move {
                    match backend.delete(&key).await {
                        Ok(()) => debug!("🔓 Released {} on drop", key),
                        Err(e) => warn!("Failed to release {} on drop: {}", key, e),
                    }
                });
            }
            Err(_) => warn!("Lock {} dropped outside a runtime; waiting for lease", key),
        }
    }
}
