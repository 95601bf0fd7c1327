//! Backing data source abstraction.

use crate::entity::CacheEntity;
use crate::error::{Error, Result};
use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// The slow store behind the cache, typically a database table.
///
/// Repositories must be `Clone`: logical-expiration rebuilds run on a
/// background worker and take their own handle (wrap pools in `Arc` or use
/// a pool type that is already a handle).
///
/// ```ignore
/// impl DataRepository<Shop> for ShopRepository {
///     async fn fetch_by_id(&self, id: &u64) -> cache_shield::Result<Option<Shop>> {
///         sqlx::query_as("SELECT * FROM tb_shop WHERE id = $1")
///             .bind(*id as i64)
///             .fetch_optional(&self.pool)
///             .await
///             .map_err(|e| cache_shield::Error::RepositoryError(e.to_string()))
///     }
/// }
/// ```
pub trait DataRepository<T: CacheEntity>: Clone + Send + Sync + 'static {
    /// Load by primary key. `Ok(None)` if no such row.
    fn fetch_by_id(&self, id: &T::Key) -> impl Future<Output = Result<Option<T>>> + Send;

    /// Insert or update. Read-only repositories keep the default.
    fn save(&self, _entity: &T) -> impl Future<Output = Result<()>> + Send {
        async {
            Err(Error::RepositoryError(
                "repository is read-only".to_string(),
            ))
        }
    }
}

struct Inner<T: CacheEntity> {
    rows: DashMap<T::Key, T>,
    fetches: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    fail: AtomicBool,
    latency: Option<Duration>,
}

/// In-memory repository for tests and demos.
///
/// Clones share rows and counters. Records how many fetches ran and the
/// peak number running at once, and can inject latency or failures.
pub struct InMemoryRepository<T: CacheEntity> {
    inner: Arc<Inner<T>>,
}

impl<T: CacheEntity> Clone for InMemoryRepository<T> {
    fn clone(&self) -> Self {
        InMemoryRepository {
            inner: self.inner.clone(),
        }
    }
}

impl<T: CacheEntity> Default for InMemoryRepository<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: CacheEntity> InMemoryRepository<T> {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Repository whose fetches each take `latency`.
    pub fn with_latency(latency: Duration) -> Self {
        Self::build(Some(latency))
    }

    fn build(latency: Option<Duration>) -> Self {
        InMemoryRepository {
            inner: Arc::new(Inner {
                rows: DashMap::new(),
                fetches: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
                latency,
            }),
        }
    }

    pub fn insert(&self, id: T::Key, entity: T) {
        self.inner.rows.insert(id, entity);
    }

    pub fn remove(&self, id: &T::Key) -> Option<T> {
        self.inner.rows.remove(id).map(|(_, v)| v)
    }

    /// Make every following fetch and save fail (or succeed again).
    pub fn set_failing(&self, fail: bool) {
        self.inner.fail.store(fail, Ordering::SeqCst);
    }

    /// Number of `fetch_by_id` calls so far.
    pub fn fetch_count(&self) -> usize {
        self.inner.fetches.load(Ordering::SeqCst)
    }

    /// Highest number of fetches that overlapped in time.
    pub fn max_concurrent_fetches(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }
}

impl<T: CacheEntity> DataRepository<T> for InMemoryRepository<T> {
    async fn fetch_by_id(&self, id: &T::Key) -> Result<Option<T>> {
        let inner = &self.inner;
        inner.fetches.fetch_add(1, Ordering::SeqCst);
        let running = inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        inner.max_in_flight.fetch_max(running, Ordering::SeqCst);

        if let Some(latency) = inner.latency {
            tokio::time::sleep(latency).await;
        }

        let result = if inner.fail.load(Ordering::SeqCst) {
            Err(Error::RepositoryError(format!(
                "simulated failure loading {}",
                id
            )))
        } else {
            Ok(inner.rows.get(id).map(|row| row.value().clone()))
        };

        inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn save(&self, entity: &T) -> Result<()> {
        if self.inner.fail.load(Ordering::SeqCst) {
            return Err(Error::RepositoryError(
                "simulated failure saving entity".to_string(),
            ));
        }
        self.inner.rows.insert(entity.cache_key(), entity.clone());
        Ok(())
    }
}
