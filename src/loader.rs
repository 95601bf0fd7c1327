//! Cache-aside loader - main entry point for cache reads.

use crate::backend::CacheBackend;
use crate::config::{ExecutorConfig, LoaderConfig};
use crate::entity::CacheEntity;
use crate::error::{Error, Result};
use crate::feed::CacheFeed;
use crate::invalidator::Invalidator;
use crate::key::CacheKeyBuilder;
use crate::lock::{DistributedLock, LockGuard};
use crate::observability::{CacheMetrics, NoOpMetrics, TtlPolicy};
use crate::rebuild::RebuildExecutor;
use crate::repository::DataRepository;
use crate::serialization::{decode_entry, encode_entry, CacheEntry, Cached, EntryFormat, NULL_MARKER};
use crate::strategy::RebuildPolicy;
use std::time::{Duration, Instant};

/// Per-operation overrides (see [`crate::CacheOperationBuilder`]).
#[derive(Clone, Debug, Default)]
pub struct OperationConfig {
    /// Entity TTL for this operation instead of the loader's policy.
    pub ttl: Option<Duration>,
}

/// What a cache key currently holds.
enum Slot<T> {
    Absent,
    Null,
    Entry(CacheEntry<T>),
    /// Present but undecodable; handled like a miss.
    Corrupt,
}

/// How a read was answered.
pub(crate) enum Served<T> {
    /// Cached entity, repository untouched.
    Hit(T),
    /// Fetched from the repository on this call.
    Loaded(T),
    /// Cached "not found" marker.
    NullHit,
    /// Nothing cached and nothing loaded (repository had no row, or the key
    /// was never warmed).
    NotFound,
}

impl<T> Served<T> {
    pub(crate) fn into_option(self) -> Option<T> {
        match self {
            Served::Hit(entity) | Served::Loaded(entity) => Some(entity),
            Served::NullHit | Served::NotFound => None,
        }
    }
}

/// Settings a background rebuild carries with it.
#[derive(Clone, Copy)]
struct LogicalWrite {
    window: Duration,
    physical_ttl: Option<Duration>,
    null_ttl: Duration,
    format: EntryFormat,
}

/// Cache-aside loader over a shared key-value store.
///
/// One loader serves every entity type; the [`RebuildPolicy`] is chosen per
/// call. Wrap it in an `Arc` (or use [`crate::CacheService`]) to share it
/// across tasks.
///
/// # Example
///
/// ```ignore
/// use cache_shield::{CacheAsideLoader, RebuildPolicy, backend::InMemoryBackend};
///
/// let loader = CacheAsideLoader::new(InMemoryBackend::new());
/// let shop = loader.get::<Shop, _>(&7, &repo, RebuildPolicy::Mutex).await?;
/// ```
pub struct CacheAsideLoader<B: CacheBackend> {
    backend: B,
    lock: DistributedLock<B>,
    executor: RebuildExecutor,
    metrics: Box<dyn CacheMetrics>,
    pub(crate) config: LoaderConfig,
}

impl<B: CacheBackend> CacheAsideLoader<B> {
    /// Loader with default settings.
    ///
    /// Starts the rebuild workers, so it must be called inside a tokio runtime.
    pub fn new(backend: B) -> Self {
        Self::build(
            backend,
            LoaderConfig::default(),
            RebuildExecutor::new(ExecutorConfig::default()),
        )
    }

    /// Loader with explicit settings.
    ///
    /// # Errors
    ///
    /// `Error::ConfigError` if `config` fails validation.
    pub fn with_config(backend: B, config: LoaderConfig, executor: ExecutorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(backend, config, RebuildExecutor::new(executor)))
    }

    fn build(backend: B, config: LoaderConfig, executor: RebuildExecutor) -> Self {
        CacheAsideLoader {
            lock: DistributedLock::new(backend.clone()),
            backend,
            executor,
            metrics: Box::new(NoOpMetrics),
            config,
        }
    }

    /// Set custom metrics handler.
    pub fn with_metrics(mut self, metrics: Box<dyn CacheMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Set custom TTL policy for loaded entities.
    ///
    /// # Errors
    ///
    /// `Error::ConfigError` if some TTL the policy can produce is not longer
    /// than the null-marker TTL.
    pub fn with_ttl_policy(mut self, policy: TtlPolicy) -> Result<Self> {
        self.config.ttl_policy = policy;
        self.config.validate()?;
        Ok(self)
    }

    /// Create a builder for operations with TTL overrides or retries.
    pub fn builder(&self) -> crate::builder::CacheOperationBuilder<'_, B> {
        crate::builder::CacheOperationBuilder::new(self)
    }

    /// Write-path helper sharing this loader's store and namespace.
    pub fn invalidator(&self) -> Invalidator<B> {
        Invalidator::from_config(self.backend.clone(), &self.config)
    }

    /// Feeder-style cache operation.
    ///
    /// Loads `feeder.entity_id()` under `policy` and feeds the result.
    ///
    /// # Errors
    ///
    /// - `Error::ValidationError`: feeder or entity validation fails
    /// - `Error::StoreUnavailable`: store unreachable
    /// - `Error::RepositoryError`: database access fails (not for logical expiration)
    /// - `Error::LockContention`: mutex policy gave up waiting
    /// - `Error::SerializationError`: entity could not be encoded
    pub async fn with<T, F, R>(&self, feeder: &mut F, repository: &R, policy: RebuildPolicy) -> Result<()>
    where
        T: CacheEntity,
        F: CacheFeed<T>,
        R: DataRepository<T>,
    {
        self.execute::<T, F, R>(feeder, repository, policy, &OperationConfig::default())
            .await
    }

    pub(crate) async fn execute<T, F, R>(
        &self,
        feeder: &mut F,
        repository: &R,
        policy: RebuildPolicy,
        op: &OperationConfig,
    ) -> Result<()>
    where
        T: CacheEntity,
        F: CacheFeed<T>,
        R: DataRepository<T>,
    {
        feeder.validate()?;
        let id = feeder.entity_id();
        let cache_key = CacheKeyBuilder::data::<T>(&self.config.namespace, &id);

        match self.load::<T, R>(&id, repository, policy, op).await? {
            Served::Hit(entity) => {
                entity.validate()?;
                feeder.on_hit(&cache_key)?;
                feeder.on_loaded(&entity)?;
                feeder.feed(Some(entity));
            }
            Served::Loaded(entity) => {
                entity.validate()?;
                feeder.on_miss(&cache_key)?;
                feeder.on_loaded(&entity)?;
                feeder.feed(Some(entity));
            }
            Served::NullHit => {
                feeder.on_hit(&cache_key)?;
                feeder.feed(None);
            }
            Served::NotFound => {
                feeder.on_miss(&cache_key)?;
                feeder.feed(None);
            }
        }
        Ok(())
    }

    /// Look up one entity. `Ok(None)` means it does not exist (or, under
    /// logical expiration, was never warmed).
    pub async fn get<T, R>(&self, id: &T::Key, repository: &R, policy: RebuildPolicy) -> Result<Option<T>>
    where
        T: CacheEntity,
        R: DataRepository<T>,
    {
        let served = self
            .load::<T, R>(id, repository, policy, &OperationConfig::default())
            .await?;
        Ok(served.into_option())
    }

    pub(crate) async fn load<T, R>(
        &self,
        id: &T::Key,
        repository: &R,
        policy: RebuildPolicy,
        op: &OperationConfig,
    ) -> Result<Served<T>>
    where
        T: CacheEntity,
        R: DataRepository<T>,
    {
        let timer = Instant::now();
        let key = CacheKeyBuilder::data::<T>(&self.config.namespace, id);
        debug!("» Cache operation for key: {} (policy: {})", key, policy);

        let result = match policy {
            RebuildPolicy::PassThrough => self.pass_through::<T, R>(&key, id, repository, op).await,
            RebuildPolicy::Mutex => self.mutex::<T, R>(&key, id, repository, op).await,
            RebuildPolicy::LogicalExpiration => self.logical::<T, R>(&key, id, repository).await,
        };

        match &result {
            Ok(Served::Hit(_)) => {
                self.metrics.record_hit(&key, timer.elapsed());
                debug!("✓ {} served from cache in {:?}", key, timer.elapsed());
            }
            Ok(Served::Loaded(_)) => {
                self.metrics.record_load(&key, timer.elapsed());
                debug!("✓ {} loaded in {:?}", key, timer.elapsed());
            }
            Ok(Served::NullHit | Served::NotFound) => {
                self.metrics.record_miss(&key, timer.elapsed());
                debug!("{} not found ({:?})", key, timer.elapsed());
            }
            Err(e) => self.metrics.record_error(&key, &e.to_string()),
        }
        result
    }

    /// Load `id` and store it with a logical expiry `window` from now.
    ///
    /// Required before logical-expiration reads can serve the key. Returns
    /// `false` (and caches the null marker) if the entity does not exist.
    pub async fn warm<T, R>(&self, id: &T::Key, repository: &R, window: Duration) -> Result<bool>
    where
        T: CacheEntity,
        R: DataRepository<T>,
    {
        let key = CacheKeyBuilder::data::<T>(&self.config.namespace, id);
        let settings = LogicalWrite {
            window,
            ..self.logical_settings()
        };
        let found = write_logical::<T, B, R>(&self.backend, repository, id, &key, settings).await?;
        info!("Warmed {} (found: {}, window: {:?})", key, found, window);
        Ok(found)
    }

    /// Remove the cached value for `id`.
    pub async fn evict<T: CacheEntity>(&self, id: &T::Key) -> Result<()> {
        self.invalidator().evict::<T>(id).await
    }

    /// Pass-through: load on miss, cache "not found" as the null marker.
    async fn pass_through<T, R>(
        &self,
        key: &str,
        id: &T::Key,
        repository: &R,
        op: &OperationConfig,
    ) -> Result<Served<T>>
    where
        T: CacheEntity,
        R: DataRepository<T>,
    {
        match self.peek::<T>(key).await? {
            Slot::Entry(entry) => return Ok(Served::Hit(entry.into_payload())),
            Slot::Null => {
                self.metrics.record_null_hit(key);
                return Ok(Served::NullHit);
            }
            Slot::Absent | Slot::Corrupt => {}
        }

        debug!("Cache miss for {}, falling back to repository", key);
        self.populate::<T, R>(key, id, repository, op).await
    }

    /// Mutex: only the lock holder loads; everyone else backs off and rereads.
    async fn mutex<T, R>(
        &self,
        key: &str,
        id: &T::Key,
        repository: &R,
        op: &OperationConfig,
    ) -> Result<Served<T>>
    where
        T: CacheEntity,
        R: DataRepository<T>,
    {
        let lock_key = CacheKeyBuilder::lock::<T>(id);
        let max_attempts = self.config.max_lock_attempts;

        for attempt in 1..=max_attempts {
            match self.peek::<T>(key).await? {
                Slot::Entry(entry) => return Ok(Served::Hit(entry.into_payload())),
                Slot::Null => {
                    self.metrics.record_null_hit(key);
                    return Ok(Served::NullHit);
                }
                Slot::Absent | Slot::Corrupt => {}
            }

            if let Some(guard) = self
                .lock
                .try_acquire(&lock_key, self.config.lock_lease)
                .await?
            {
                let result = self.load_locked::<T, R>(key, id, repository, op).await;
                // Failed release is logged by the guard; the lease cleans up
                let _ = guard.release().await;
                return result;
            }

            self.metrics.record_lock_contention(key);
            debug!(
                "Lock {} busy (attempt {}/{}), backing off",
                lock_key, attempt, max_attempts
            );
            if attempt < max_attempts {
                tokio::time::sleep(self.config.lock_retry_backoff).await;
            }
        }

        Err(Error::LockContention {
            key: lock_key,
            attempts: max_attempts,
        })
    }

    /// Repository load while holding the lock.
    ///
    /// Rereads first: the previous holder may have filled the key between
    /// our miss and our acquire.
    async fn load_locked<T, R>(
        &self,
        key: &str,
        id: &T::Key,
        repository: &R,
        op: &OperationConfig,
    ) -> Result<Served<T>>
    where
        T: CacheEntity,
        R: DataRepository<T>,
    {
        match self.peek::<T>(key).await? {
            Slot::Entry(entry) => Ok(Served::Hit(entry.into_payload())),
            Slot::Null => Ok(Served::NullHit),
            Slot::Absent | Slot::Corrupt => self.populate::<T, R>(key, id, repository, op).await,
        }
    }

    /// Logical expiration: serve whatever is cached, refresh stale entries
    /// in the background.
    async fn logical<T, R>(&self, key: &str, id: &T::Key, repository: &R) -> Result<Served<T>>
    where
        T: CacheEntity,
        R: DataRepository<T>,
    {
        match self.peek::<T>(key).await? {
            Slot::Absent => {
                debug!("{} not warmed", key);
                Ok(Served::NotFound)
            }
            Slot::Null => {
                self.metrics.record_null_hit(key);
                Ok(Served::NullHit)
            }
            Slot::Corrupt => {
                self.schedule_rebuild::<T, R>(key, id, repository).await;
                Ok(Served::NotFound)
            }
            Slot::Entry(entry) => {
                if entry.is_stale() {
                    self.metrics.record_stale(key);
                    debug!("{} logically expired, serving stale copy", key);
                    self.schedule_rebuild::<T, R>(key, id, repository).await;
                }
                Ok(Served::Hit(entry.into_payload()))
            }
        }
    }

    /// Take the rebuild lock and hand it to a background job.
    ///
    /// Never fails: every problem here is logged and the caller keeps the
    /// value it already has.
    async fn schedule_rebuild<T, R>(&self, key: &str, id: &T::Key, repository: &R)
    where
        T: CacheEntity,
        R: DataRepository<T>,
    {
        let lock_key = CacheKeyBuilder::lock::<T>(id);
        let guard = match self.lock.try_acquire(&lock_key, self.config.lock_lease).await {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                debug!("Rebuild for {} already in progress", key);
                return;
            }
            Err(e) => {
                warn!("Could not take rebuild lock {}: {}", lock_key, e);
                return;
            }
        };

        let job = rebuild_logical::<T, B, R>(
            self.backend.clone(),
            repository.clone(),
            id.clone(),
            key.to_string(),
            self.logical_settings(),
            guard,
        );

        match self.executor.submit(key, job) {
            Ok(true) => self.metrics.record_rebuild_scheduled(key),
            Ok(false) => {}
            Err(e) => {
                self.metrics.record_error(key, &e.to_string());
                warn!("Rebuild for {} not scheduled: {}", key, e);
            }
        }
    }

    /// Load from the repository and cache the answer with physical TTLs.
    async fn populate<T, R>(
        &self,
        key: &str,
        id: &T::Key,
        repository: &R,
        op: &OperationConfig,
    ) -> Result<Served<T>>
    where
        T: CacheEntity,
        R: DataRepository<T>,
    {
        match repository.fetch_by_id(id).await? {
            Some(entity) => {
                let ttl = op
                    .ttl
                    .unwrap_or_else(|| self.config.ttl_policy.get_ttl(T::cache_prefix()));
                let bytes = encode_entry(&CacheEntry::new(&entity), self.config.entry_format)?;
                self.backend.set(key, bytes, Some(ttl)).await?;
                Ok(Served::Loaded(entity))
            }
            None => {
                debug!("{} absent from repository, caching null marker", key);
                self.backend
                    .set(key, NULL_MARKER.to_vec(), Some(self.config.null_ttl))
                    .await?;
                Ok(Served::NotFound)
            }
        }
    }

    async fn peek<T: CacheEntity>(&self, key: &str) -> Result<Slot<T>> {
        let Some(bytes) = self.backend.get(key).await? else {
            return Ok(Slot::Absent);
        };

        match decode_entry::<T>(&bytes) {
            Ok(Cached::Entry(entry)) => Ok(Slot::Entry(entry)),
            Ok(Cached::Null) => Ok(Slot::Null),
            Err(e) if e.is_decode_error() => {
                warn!("Unreadable cache entry at {}: {} (treating as miss)", key, e);
                Ok(Slot::Corrupt)
            }
            Err(e) => Err(e),
        }
    }

    fn logical_settings(&self) -> LogicalWrite {
        LogicalWrite {
            window: self.config.logical_window,
            physical_ttl: self.config.logical_physical_ttl,
            null_ttl: self.config.null_ttl,
            format: self.config.entry_format,
        }
    }

    /// Get backend reference (for advanced use).
    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Background rebuild pool, e.g. to `wait_idle` on shutdown.
    pub fn executor(&self) -> &RebuildExecutor {
        &self.executor
    }
}

/// Background job: reload, rewrite with a fresh logical expiry, release.
async fn rebuild_logical<T, B, R>(
    backend: B,
    repository: R,
    id: T::Key,
    key: String,
    settings: LogicalWrite,
    guard: LockGuard<B>,
) -> Result<()>
where
    T: CacheEntity,
    B: CacheBackend,
    R: DataRepository<T>,
{
    let outcome = write_logical::<T, B, R>(&backend, &repository, &id, &key, settings).await;
    let _ = guard.release().await;

    match outcome {
        Ok(found) => {
            debug!("✓ Rebuilt {} (found: {})", key, found);
            Ok(())
        }
        Err(e) => Err(Error::RebuildFailure {
            key,
            reason: e.to_string(),
        }),
    }
}

async fn write_logical<T, B, R>(
    backend: &B,
    repository: &R,
    id: &T::Key,
    key: &str,
    settings: LogicalWrite,
) -> Result<bool>
where
    T: CacheEntity,
    B: CacheBackend,
    R: DataRepository<T>,
{
    match repository.fetch_by_id(id).await? {
        Some(entity) => {
            let entry = CacheEntry::expiring_in(entity, settings.window);
            let bytes = encode_entry(&entry, settings.format)?;
            backend.set(key, bytes, settings.physical_ttl).await?;
            Ok(true)
        }
        None => {
            backend
                .set(key, NULL_MARKER.to_vec(), Some(settings.null_ttl))
                .await?;
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::feed::GenericFeeder;
    use crate::repository::InMemoryRepository;
    use serde::{Deserialize, Serialize};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Shop {
        id: u64,
        name: String,
    }

    impl CacheEntity for Shop {
        type Key = u64;

        fn cache_key(&self) -> Self::Key {
            self.id
        }

        fn cache_prefix() -> &'static str {
            "shop"
        }
    }

    fn shop(id: u64, name: &str) -> Shop {
        Shop {
            id,
            name: name.to_string(),
        }
    }

    fn test_config() -> LoaderConfig {
        LoaderConfig {
            lock_retry_backoff: Duration::from_millis(5),
            max_lock_attempts: 200,
            ..Default::default()
        }
    }

    fn loader(backend: InMemoryBackend) -> CacheAsideLoader<InMemoryBackend> {
        CacheAsideLoader::with_config(backend, test_config(), ExecutorConfig::default()).unwrap()
    }

    async fn read_entry(backend: &InMemoryBackend, key: &str) -> Cached<Shop> {
        let bytes = backend.get(key).await.unwrap().expect("key missing");
        decode_entry::<Shop>(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_pass_through_loads_and_caches() {
        let backend = InMemoryBackend::new();
        let loader = loader(backend.clone());
        let repo = InMemoryRepository::new();
        repo.insert(1, shop(1, "db"));

        let first = loader
            .get::<Shop, _>(&1, &repo, RebuildPolicy::PassThrough)
            .await
            .unwrap();
        let second = loader
            .get::<Shop, _>(&1, &repo, RebuildPolicy::PassThrough)
            .await
            .unwrap();

        assert_eq!(first, Some(shop(1, "db")));
        assert_eq!(second, Some(shop(1, "db")));
        assert_eq!(repo.fetch_count(), 1);

        let ttl = backend.ttl_remaining("cache:shop:1").unwrap();
        assert!(ttl > Duration::from_secs(29 * 60));
    }

    #[tokio::test]
    async fn test_absent_entity_caches_null_marker() {
        let backend = InMemoryBackend::new();
        let loader = loader(backend.clone());
        let repo: InMemoryRepository<Shop> = InMemoryRepository::new();

        for policy in [RebuildPolicy::PassThrough, RebuildPolicy::Mutex] {
            backend.clear();
            let before = repo.fetch_count();

            assert_eq!(loader.get::<Shop, _>(&100, &repo, policy).await.unwrap(), None);
            assert_eq!(loader.get::<Shop, _>(&100, &repo, policy).await.unwrap(), None);
            assert_eq!(repo.fetch_count() - before, 1);

            assert_eq!(read_entry(&backend, "cache:shop:100").await, Cached::Null);
            let ttl = backend.ttl_remaining("cache:shop:100").unwrap();
            assert!(ttl <= Duration::from_secs(120));
        }
    }

    #[tokio::test]
    async fn test_null_marker_never_served_as_entity() {
        let backend = InMemoryBackend::new();
        let loader = loader(backend.clone());
        let repo = InMemoryRepository::new();
        repo.insert(5, shop(5, "exists now"));
        backend
            .set("cache:shop:5", NULL_MARKER.to_vec(), Some(Duration::from_secs(60)))
            .await
            .unwrap();

        for policy in [
            RebuildPolicy::PassThrough,
            RebuildPolicy::Mutex,
            RebuildPolicy::LogicalExpiration,
        ] {
            assert_eq!(loader.get::<Shop, _>(&5, &repo, policy).await.unwrap(), None);
        }
        assert_eq!(repo.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_corrupted_entry_treated_as_miss() {
        let backend = InMemoryBackend::new();
        let loader = loader(backend.clone());
        let repo = InMemoryRepository::new();
        repo.insert(3, shop(3, "fresh"));
        backend
            .set("cache:shop:3", b"CSHD\x01\x00\x00\x00garbage".to_vec(), None)
            .await
            .unwrap();

        let result = loader
            .get::<Shop, _>(&3, &repo, RebuildPolicy::PassThrough)
            .await
            .unwrap();
        assert_eq!(result, Some(shop(3, "fresh")));
        assert!(matches!(
            read_entry(&backend, "cache:shop:3").await,
            Cached::Entry(_)
        ));
    }

    #[tokio::test]
    async fn test_mutex_releases_lock_after_load() {
        let backend = InMemoryBackend::new();
        let loader = loader(backend.clone());
        let repo = InMemoryRepository::new();
        repo.insert(1, shop(1, "db"));

        let result = loader
            .get::<Shop, _>(&1, &repo, RebuildPolicy::Mutex)
            .await
            .unwrap();
        assert_eq!(result, Some(shop(1, "db")));
        assert!(backend.get("lock:shop:1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mutex_releases_lock_on_repository_error() {
        let backend = InMemoryBackend::new();
        let loader = loader(backend.clone());
        let repo: InMemoryRepository<Shop> = InMemoryRepository::new();
        repo.set_failing(true);

        let err = loader
            .get::<Shop, _>(&1, &repo, RebuildPolicy::Mutex)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RepositoryError(_)));
        assert!(backend.get("lock:shop:1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mutex_gives_up_with_lock_contention() {
        let backend = InMemoryBackend::new();
        let config = LoaderConfig {
            lock_retry_backoff: Duration::from_millis(1),
            max_lock_attempts: 3,
            ..Default::default()
        };
        let loader =
            CacheAsideLoader::with_config(backend.clone(), config, ExecutorConfig::default())
                .unwrap();
        let repo = InMemoryRepository::new();
        repo.insert(1, shop(1, "db"));

        // Someone else is rebuilding and never finishes
        backend
            .set_if_absent("lock:shop:1", b"1".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();

        let err = loader
            .get::<Shop, _>(&1, &repo, RebuildPolicy::Mutex)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            Error::LockContention {
                key: "lock:shop:1".to_string(),
                attempts: 3
            }
        );
        assert!(err.is_retryable());
        assert_eq!(repo.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_mutex_waiter_picks_up_holders_result() {
        let backend = InMemoryBackend::new();
        let loader = Arc::new(loader(backend.clone()));
        let repo = InMemoryRepository::new();
        repo.insert(1, shop(1, "db"));

        backend
            .set_if_absent("lock:shop:1", b"1".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();

        let waiter = {
            let loader = loader.clone();
            let repo = repo.clone();
            tokio::spawn(async move {
                loader
                    .get::<Shop, _>(&1, &repo, RebuildPolicy::Mutex)
                    .await
            })
        };

        // The "other holder" fills the cache and releases
        tokio::time::sleep(Duration::from_millis(20)).await;
        let bytes = encode_entry(&CacheEntry::new(shop(1, "from holder")), EntryFormat::Binary)
            .unwrap();
        backend.set("cache:shop:1", bytes, None).await.unwrap();
        backend.delete("lock:shop:1").await.unwrap();

        let result = waiter.await.unwrap().unwrap();
        assert_eq!(result, Some(shop(1, "from holder")));
        assert_eq!(repo.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_logical_cold_miss_does_not_load() {
        let loader = loader(InMemoryBackend::new());
        let repo = InMemoryRepository::new();
        repo.insert(1, shop(1, "db"));

        let result = loader
            .get::<Shop, _>(&1, &repo, RebuildPolicy::LogicalExpiration)
            .await
            .unwrap();
        assert_eq!(result, None);
        assert_eq!(repo.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_warm_writes_logical_entry_without_physical_ttl() {
        let backend = InMemoryBackend::new();
        let loader = loader(backend.clone());
        let repo = InMemoryRepository::new();
        repo.insert(1, shop(1, "db"));

        assert!(loader
            .warm::<Shop, _>(&1, &repo, Duration::from_secs(30))
            .await
            .unwrap());
        assert!(backend.ttl_remaining("cache:shop:1").is_none());

        match read_entry(&backend, "cache:shop:1").await {
            Cached::Entry(entry) => {
                assert!(entry.logical_expiry.is_some());
                assert!(!entry.is_stale());
            }
            Cached::Null => panic!("expected entry"),
        }

        let result = loader
            .get::<Shop, _>(&1, &repo, RebuildPolicy::LogicalExpiration)
            .await
            .unwrap();
        assert_eq!(result, Some(shop(1, "db")));
        assert_eq!(repo.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_warm_missing_entity_caches_null() {
        let backend = InMemoryBackend::new();
        let loader = loader(backend.clone());
        let repo: InMemoryRepository<Shop> = InMemoryRepository::new();

        assert!(!loader
            .warm::<Shop, _>(&9, &repo, Duration::from_secs(30))
            .await
            .unwrap());
        assert_eq!(read_entry(&backend, "cache:shop:9").await, Cached::Null);
    }

    #[tokio::test]
    async fn test_logical_stale_serves_old_value_then_refreshes() {
        let backend = InMemoryBackend::new();
        let loader = loader(backend.clone());
        let repo = InMemoryRepository::new();
        repo.insert(7, shop(7, "old"));

        loader
            .warm::<Shop, _>(&7, &repo, Duration::ZERO)
            .await
            .unwrap();
        let Cached::Entry(before) = read_entry(&backend, "cache:shop:7").await else {
            panic!("expected entry");
        };
        repo.insert(7, shop(7, "new"));

        let stale = loader
            .get::<Shop, _>(&7, &repo, RebuildPolicy::LogicalExpiration)
            .await
            .unwrap();
        assert_eq!(stale, Some(shop(7, "old")));

        loader.executor().wait_idle().await;

        let fresh = loader
            .get::<Shop, _>(&7, &repo, RebuildPolicy::LogicalExpiration)
            .await
            .unwrap();
        assert_eq!(fresh, Some(shop(7, "new")));

        let Cached::Entry(after) = read_entry(&backend, "cache:shop:7").await else {
            panic!("expected entry");
        };
        assert!(after.logical_expiry > before.logical_expiry);
        assert!(backend.get("lock:shop:7").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_logical_rebuild_failure_keeps_stale_and_frees_lock() {
        let backend = InMemoryBackend::new();
        let loader = loader(backend.clone());
        let repo = InMemoryRepository::new();
        repo.insert(7, shop(7, "old"));
        loader
            .warm::<Shop, _>(&7, &repo, Duration::ZERO)
            .await
            .unwrap();

        repo.set_failing(true);
        let result = loader
            .get::<Shop, _>(&7, &repo, RebuildPolicy::LogicalExpiration)
            .await
            .unwrap();
        assert_eq!(result, Some(shop(7, "old")));

        loader.executor().wait_idle().await;
        assert_eq!(loader.executor().stats().failed, 1);
        assert!(backend.get("lock:shop:7").await.unwrap().is_none());

        // Still serving the stale copy
        let again = loader
            .get::<Shop, _>(&7, &repo, RebuildPolicy::LogicalExpiration)
            .await
            .unwrap();
        assert_eq!(again, Some(shop(7, "old")));
    }

    #[tokio::test]
    async fn test_logical_skips_rebuild_when_lock_held() {
        let backend = InMemoryBackend::new();
        let loader = loader(backend.clone());
        let repo = InMemoryRepository::new();
        repo.insert(7, shop(7, "old"));
        loader
            .warm::<Shop, _>(&7, &repo, Duration::ZERO)
            .await
            .unwrap();
        backend
            .set_if_absent("lock:shop:7", b"1".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();

        let result = loader
            .get::<Shop, _>(&7, &repo, RebuildPolicy::LogicalExpiration)
            .await
            .unwrap();
        assert_eq!(result, Some(shop(7, "old")));
        assert_eq!(loader.executor().pending_count(), 0);
        assert_eq!(repo.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_logical_rebuild_of_deleted_entity_caches_null() {
        let backend = InMemoryBackend::new();
        let loader = loader(backend.clone());
        let repo = InMemoryRepository::new();
        repo.insert(7, shop(7, "old"));
        loader
            .warm::<Shop, _>(&7, &repo, Duration::ZERO)
            .await
            .unwrap();
        repo.remove(&7);

        loader
            .get::<Shop, _>(&7, &repo, RebuildPolicy::LogicalExpiration)
            .await
            .unwrap();
        loader.executor().wait_idle().await;

        let result = loader
            .get::<Shop, _>(&7, &repo, RebuildPolicy::LogicalExpiration)
            .await
            .unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn test_entries_without_logical_expiry_are_fresh_under_logical_policy() {
        let backend = InMemoryBackend::new();
        let loader = loader(backend.clone());
        let repo = InMemoryRepository::new();
        repo.insert(1, shop(1, "db"));

        loader
            .get::<Shop, _>(&1, &repo, RebuildPolicy::PassThrough)
            .await
            .unwrap();
        let result = loader
            .get::<Shop, _>(&1, &repo, RebuildPolicy::LogicalExpiration)
            .await
            .unwrap();

        assert_eq!(result, Some(shop(1, "db")));
        assert_eq!(loader.executor().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_with_feeder() {
        let loader = loader(InMemoryBackend::new());
        let repo = InMemoryRepository::new();
        repo.insert(1, shop(1, "db"));

        let mut feeder = GenericFeeder::new(1);
        loader
            .with::<Shop, _, _>(&mut feeder, &repo, RebuildPolicy::Mutex)
            .await
            .expect("Failed to execute");
        assert_eq!(feeder.data, Some(shop(1, "db")));

        let mut missing = GenericFeeder::new(2);
        loader
            .with::<Shop, _, _>(&mut missing, &repo, RebuildPolicy::Mutex)
            .await
            .expect("Failed to execute");
        assert!(missing.data.is_none());
    }

    #[tokio::test]
    async fn test_custom_metrics() {
        #[derive(Clone, Default)]
        struct TestMetrics {
            hits: Arc<Mutex<usize>>,
            loads: Arc<Mutex<usize>>,
            misses: Arc<Mutex<usize>>,
            null_hits: Arc<Mutex<usize>>,
        }

        impl CacheMetrics for TestMetrics {
            fn record_hit(&self, _key: &str, _duration: Duration) {
                *self.hits.lock().expect("Failed to lock hits") += 1;
            }

            fn record_load(&self, _key: &str, _duration: Duration) {
                *self.loads.lock().expect("Failed to lock loads") += 1;
            }

            fn record_miss(&self, _key: &str, _duration: Duration) {
                *self.misses.lock().expect("Failed to lock misses") += 1;
            }

            fn record_null_hit(&self, _key: &str) {
                *self.null_hits.lock().expect("Failed to lock null hits") += 1;
            }
        }

        let metrics = TestMetrics::default();
        let loader = loader(InMemoryBackend::new()).with_metrics(Box::new(metrics.clone()));
        let repo = InMemoryRepository::new();
        repo.insert(1, shop(1, "db"));

        for id in [1, 1, 2, 2] {
            loader
                .get::<Shop, _>(&id, &repo, RebuildPolicy::PassThrough)
                .await
                .unwrap();
        }

        assert_eq!(*metrics.loads.lock().unwrap(), 1);
        assert_eq!(*metrics.hits.lock().unwrap(), 1);
        assert_eq!(*metrics.misses.lock().unwrap(), 2);
        assert_eq!(*metrics.null_hits.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_feeder_hooks_distinguish_cache_from_repository() {
        #[derive(Default)]
        struct RecordingFeeder {
            id: u64,
            events: Vec<&'static str>,
            data: Option<Shop>,
        }

        impl CacheFeed<Shop> for RecordingFeeder {
            fn entity_id(&mut self) -> u64 {
                self.id
            }

            fn feed(&mut self, entity: Option<Shop>) {
                self.data = entity;
            }

            fn on_hit(&mut self, _key: &str) -> Result<()> {
                self.events.push("hit");
                Ok(())
            }

            fn on_miss(&mut self, _key: &str) -> Result<()> {
                self.events.push("miss");
                Ok(())
            }

            fn on_loaded(&mut self, _entity: &Shop) -> Result<()> {
                self.events.push("loaded");
                Ok(())
            }
        }

        let loader = loader(InMemoryBackend::new());
        let repo = InMemoryRepository::new();
        repo.insert(1, shop(1, "db"));

        let mut cold = RecordingFeeder {
            id: 1,
            ..Default::default()
        };
        loader
            .with::<Shop, _, _>(&mut cold, &repo, RebuildPolicy::PassThrough)
            .await
            .unwrap();
        assert_eq!(cold.events, vec!["miss", "loaded"]);

        let mut warm = RecordingFeeder {
            id: 1,
            ..Default::default()
        };
        loader
            .with::<Shop, _, _>(&mut warm, &repo, RebuildPolicy::PassThrough)
            .await
            .unwrap();
        assert_eq!(warm.events, vec!["hit", "loaded"]);
        assert_eq!(warm.data, Some(shop(1, "db")));

        for expected in [vec!["miss"], vec!["hit"]] {
            let mut missing = RecordingFeeder {
                id: 2,
                ..Default::default()
            };
            loader
                .with::<Shop, _, _>(&mut missing, &repo, RebuildPolicy::PassThrough)
                .await
                .unwrap();
            assert_eq!(missing.events, expected);
            assert!(missing.data.is_none());
        }
        assert_eq!(repo.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_ttl_policy_shorter_than_null_ttl_rejected() {
        let result = loader(InMemoryBackend::new()).with_ttl_policy(TtlPolicy::Jittered {
            base: Duration::from_secs(60),
            max_jitter: Duration::from_secs(60),
        });
        assert!(matches!(result, Err(Error::ConfigError(_))));

        let accepted = loader(InMemoryBackend::new())
            .with_ttl_policy(TtlPolicy::Fixed(Duration::from_secs(600)))
            .unwrap();
        assert_eq!(
            accepted.config().ttl_policy.get_ttl("shop"),
            Duration::from_secs(600)
        );
    }

    #[tokio::test]
    async fn test_json_entry_format() {
        let backend = InMemoryBackend::new();
        let config = LoaderConfig {
            entry_format: EntryFormat::Json,
            ..test_config()
        };
        let loader =
            CacheAsideLoader::with_config(backend.clone(), config, ExecutorConfig::default())
                .unwrap();
        let repo = InMemoryRepository::new();
        repo.insert(1, shop(1, "db"));

        loader
            .get::<Shop, _>(&1, &repo, RebuildPolicy::PassThrough)
            .await
            .unwrap();
        let raw = backend.get("cache:shop:1").await.unwrap().unwrap();
        assert_eq!(raw.first(), Some(&b'{'));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = LoaderConfig {
            max_lock_attempts: 0,
            ..Default::default()
        };
        let result =
            CacheAsideLoader::with_config(InMemoryBackend::new(), config, ExecutorConfig::default());
        assert!(matches!(result, Err(Error::ConfigError(_))));
    }
}
