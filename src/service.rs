//! Shareable handle bundling the read and write paths.

use crate::backend::CacheBackend;
use crate::config::{ExecutorConfig, LoaderConfig};
use crate::entity::CacheEntity;
use crate::error::Result;
use crate::feed::CacheFeed;
use crate::invalidator::Invalidator;
use crate::loader::CacheAsideLoader;
use crate::repository::DataRepository;
use crate::strategy::RebuildPolicy;
use std::sync::Arc;
use std::time::Duration;

/// Cache service for request handlers.
///
/// `Clone` is an `Arc` increment, so store one in your application state
/// and clone it into each task.
///
/// ```ignore
/// let cache = CacheService::new(InMemoryBackend::new());
/// let handle = cache.clone();
/// tokio::spawn(async move {
///     handle.get::<Shop, _>(&1, &repo, RebuildPolicy::Mutex).await
/// });
/// ```
pub struct CacheService<B: CacheBackend> {
    loader: Arc<CacheAsideLoader<B>>,
    invalidator: Arc<Invalidator<B>>,
}

impl<B: CacheBackend> Clone for CacheService<B> {
    fn clone(&self) -> Self {
        CacheService {
            loader: self.loader.clone(),
            invalidator: self.invalidator.clone(),
        }
    }
}

impl<B: CacheBackend> CacheService<B> {
    /// Service with default settings. Must be called inside a tokio runtime.
    pub fn new(backend: B) -> Self {
        Self::from_loader(CacheAsideLoader::new(backend))
    }

    pub fn with_config(backend: B, config: LoaderConfig, executor: ExecutorConfig) -> Result<Self> {
        Ok(Self::from_loader(CacheAsideLoader::with_config(
            backend, config, executor,
        )?))
    }

    /// Wrap a loader that was configured by hand (metrics, TTL policy).
    pub fn from_loader(loader: CacheAsideLoader<B>) -> Self {
        let invalidator = loader.invalidator();
        CacheService {
            loader: Arc::new(loader),
            invalidator: Arc::new(invalidator),
        }
    }

    /// Feeder-style read. See [`CacheAsideLoader::with`].
    pub async fn execute<T, F, R>(&self, feeder: &mut F, repository: &R, policy: RebuildPolicy) -> Result<()>
    where
        T: CacheEntity,
        F: CacheFeed<T>,
        R: DataRepository<T>,
    {
        self.loader.with::<T, F, R>(feeder, repository, policy).await
    }

    pub async fn get<T, R>(&self, id: &T::Key, repository: &R, policy: RebuildPolicy) -> Result<Option<T>>
    where
        T: CacheEntity,
        R: DataRepository<T>,
    {
        self.loader.get::<T, R>(id, repository, policy).await
    }

    /// Pre-load `id` for logical-expiration reads.
    pub async fn warm<T, R>(&self, id: &T::Key, repository: &R, window: Duration) -> Result<bool>
    where
        T: CacheEntity,
        R: DataRepository<T>,
    {
        self.loader.warm::<T, R>(id, repository, window).await
    }

    /// Save and invalidate. See [`Invalidator::update`].
    pub async fn update<T, R>(&self, entity: &T, repository: &R) -> Result<()>
    where
        T: CacheEntity,
        R: DataRepository<T>,
    {
        self.invalidator.update(entity, repository).await
    }

    pub async fn evict<T: CacheEntity>(&self, id: &T::Key) -> Result<()> {
        self.invalidator.evict::<T>(id).await
    }

    pub fn loader(&self) -> &CacheAsideLoader<B> {
        &self.loader
    }

    /// Wait for queued background rebuilds to finish.
    pub async fn wait_idle(&self) {
        self.loader.executor().wait_idle().await
    }
}
