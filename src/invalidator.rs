//! Write path: persist first, then drop the cached copy.

use crate::backend::CacheBackend;
use crate::config::LoaderConfig;
use crate::entity::CacheEntity;
use crate::error::{Error, Result};
use crate::key::CacheKeyBuilder;
use crate::repository::DataRepository;
use crate::serialization::{decode_entry, encode_entry, CacheEntry, Cached, EntryFormat};
use std::time::Duration;

/// Keeps the cache from outliving writes to the repository.
///
/// Physically expiring entries are deleted, so the next read misses and
/// reloads; a concurrent reader can at worst re-cache the value it read
/// before the save, which the entity TTL bounds. Logically expiring
/// entries are rewritten in place instead: logical-expiration reads never
/// load an absent key, so deleting one would hide the entity until the
/// next warm.
#[derive(Clone)]
pub struct Invalidator<B: CacheBackend> {
    backend: B,
    namespace: String,
    logical_window: Duration,
    logical_physical_ttl: Option<Duration>,
    entry_format: EntryFormat,
}

impl<B: CacheBackend> Invalidator<B> {
    /// Invalidator with the default logical-expiration settings.
    pub fn new(backend: B, namespace: impl Into<String>) -> Self {
        let mut invalidator = Self::from_config(backend, &LoaderConfig::default());
        invalidator.namespace = namespace.into();
        invalidator
    }

    /// Invalidator matching a loader's namespace and entry settings.
    pub fn from_config(backend: B, config: &LoaderConfig) -> Self {
        Invalidator {
            backend,
            namespace: config.namespace.clone(),
            logical_window: config.logical_window,
            logical_physical_ttl: config.logical_physical_ttl,
            entry_format: config.entry_format,
        }
    }

    /// Save `entity`, then invalidate its cache key.
    ///
    /// If the key holds a logically expiring entry it is overwritten with
    /// `entity` and a fresh window; anything else is deleted. A failed cache
    /// write after a successful save is logged and the update still
    /// succeeds; the stale copy lives at most one TTL.
    ///
    /// # Errors
    ///
    /// - `Error::ValidationError`: entity validation fails (nothing is saved)
    /// - `Error::RepositoryError`: the save failed (cache untouched)
    pub async fn update<T, R>(&self, entity: &T, repository: &R) -> Result<()>
    where
        T: CacheEntity,
        R: DataRepository<T>,
    {
        entity.validate()?;

        let id = entity.cache_key();
        let key = CacheKeyBuilder::data::<T>(&self.namespace, &id);

        repository.save(entity).await.map_err(|e| match e {
            Error::RepositoryError(_) => e,
            other => Error::RepositoryError(other.to_string()),
        })?;

        match self.refresh_logical(&key, entity).await {
            Ok(true) => {
                info!("✓ Updated {} and refreshed logical entry", key);
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => warn!("Could not refresh logical entry {}: {}, evicting", key, e),
        }

        match self.backend.delete(&key).await {
            Ok(()) => info!("✓ Updated {} and evicted cached copy", key),
            Err(e) => warn!(
                "Updated {} but could not evict cached copy: {} (stale until TTL)",
                key, e
            ),
        }
        Ok(())
    }

    /// Rewrite `key` from `entity` if it currently holds a logical entry.
    async fn refresh_logical<T: CacheEntity>(&self, key: &str, entity: &T) -> Result<bool> {
        let Some(bytes) = self.backend.get(key).await? else {
            return Ok(false);
        };
        match decode_entry::<T>(&bytes) {
            Ok(Cached::Entry(entry)) if entry.logical_expiry.is_some() => {
                let fresh = CacheEntry::expiring_in(entity, self.logical_window);
                let bytes = encode_entry(&fresh, self.entry_format)?;
                self.backend.set(key, bytes, self.logical_physical_ttl).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Delete the cached value for `id`. Missing keys are fine.
    pub async fn evict<T: CacheEntity>(&self, id: &T::Key) -> Result<()> {
        let key = CacheKeyBuilder::data::<T>(&self.namespace, id);
        self.backend.delete(&key).await?;
        debug!("Evicted {}", key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::repository::InMemoryRepository;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

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

        fn validate(&self) -> Result<()> {
            if self.name.is_empty() {
                return Err(Error::ValidationError("shop name is empty".to_string()));
            }
            Ok(())
        }
    }

    /// Store whose deletes can be made to fail.
    #[derive(Clone, Default)]
    struct StubbornBackend {
        inner: InMemoryBackend,
        fail_delete: Arc<AtomicBool>,
    }

    impl CacheBackend for StubbornBackend {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
            self.inner.set(key, value, ttl).await
        }

        async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool> {
            self.inner.set_if_absent(key, value, ttl).await
        }

        async fn delete(&self, key: &str) -> Result<()> {
            if self.fail_delete.load(Ordering::SeqCst) {
                return Err(Error::StoreUnavailable("connection reset".to_string()));
            }
            self.inner.delete(key).await
        }
    }

    fn shop(name: &str) -> Shop {
        Shop {
            id: 1,
            name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn test_update_saves_then_evicts() {
        let backend = InMemoryBackend::new();
        let invalidator = Invalidator::new(backend.clone(), "cache");
        let repo = InMemoryRepository::new();
        backend
            .set("cache:shop:1", b"old".to_vec(), None)
            .await
            .unwrap();

        invalidator.update(&shop("renamed"), &repo).await.unwrap();

        assert_eq!(repo.fetch_by_id(&1).await.unwrap(), Some(shop("renamed")));
        assert!(backend.get("cache:shop:1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_save_leaves_cache_alone() {
        let backend = InMemoryBackend::new();
        let invalidator = Invalidator::new(backend.clone(), "cache");
        let repo = InMemoryRepository::new();
        repo.set_failing(true);
        backend
            .set("cache:shop:1", b"old".to_vec(), None)
            .await
            .unwrap();

        let err = invalidator.update(&shop("renamed"), &repo).await.unwrap_err();

        assert!(matches!(err, Error::RepositoryError(_)));
        assert!(backend.get("cache:shop:1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_invalid_entity_is_not_saved() {
        let invalidator = Invalidator::new(InMemoryBackend::new(), "cache");
        let repo = InMemoryRepository::new();

        let err = invalidator.update(&shop(""), &repo).await.unwrap_err();

        assert!(matches!(err, Error::ValidationError(_)));
        assert_eq!(repo.fetch_by_id(&1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failed_evict_still_reports_success() {
        let backend = StubbornBackend::default();
        backend.fail_delete.store(true, Ordering::SeqCst);
        let invalidator = Invalidator::new(backend.clone(), "cache");
        let repo = InMemoryRepository::new();

        invalidator.update(&shop("renamed"), &repo).await.unwrap();
        assert_eq!(repo.fetch_by_id(&1).await.unwrap(), Some(shop("renamed")));
    }

    #[tokio::test]
    async fn test_evict() {
        let backend = InMemoryBackend::new();
        let invalidator = Invalidator::new(backend.clone(), "cache");
        backend
            .set("cache:shop:1", b"x".to_vec(), None)
            .await
            .unwrap();

        invalidator.evict::<Shop>(&1).await.unwrap();
        invalidator.evict::<Shop>(&1).await.unwrap();
        assert!(backend.get("cache:shop:1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_refreshes_logical_entry_in_place() {
        let backend = InMemoryBackend::new();
        let invalidator = Invalidator::new(backend.clone(), "cache");
        let repo = InMemoryRepository::new();
        let expired = CacheEntry {
            payload: shop("old"),
            logical_expiry: Some(0),
        };
        backend
            .set(
                "cache:shop:1",
                encode_entry(&expired, EntryFormat::Binary).unwrap(),
                None,
            )
            .await
            .unwrap();

        invalidator.update(&shop("renamed"), &repo).await.unwrap();

        let bytes = backend.get("cache:shop:1").await.unwrap().expect("key evicted");
        match decode_entry::<Shop>(&bytes).unwrap() {
            Cached::Entry(entry) => {
                assert_eq!(entry.payload, shop("renamed"));
                assert!(!entry.is_stale());
            }
            Cached::Null => panic!("expected entry"),
        }
        assert!(backend.ttl_remaining("cache:shop:1").is_none());
    }

    #[tokio::test]
    async fn test_update_evicts_null_marker() {
        let backend = InMemoryBackend::new();
        let invalidator = Invalidator::new(backend.clone(), "cache");
        let repo = InMemoryRepository::new();
        backend
            .set(
                "cache:shop:1",
                crate::serialization::NULL_MARKER.to_vec(),
                Some(Duration::from_secs(60)),
            )
            .await
            .unwrap();

        invalidator.update(&shop("created"), &repo).await.unwrap();
        assert!(backend.get("cache:shop:1").await.unwrap().is_none());
    }
}
