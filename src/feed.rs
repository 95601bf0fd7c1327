//! Feeder pattern: the caller describes what to load and receives the result.

use crate::entity::CacheEntity;
use crate::error::Result;

/// Receives the outcome of a cache operation.
///
/// # Example
///
/// ```
/// use cache_shield::{CacheEntity, CacheFeed};
/// # use serde::{Deserialize, Serialize};
/// # #[derive(Clone, Serialize, Deserialize)]
/// # struct Shop { id: u64 }
/// # impl CacheEntity for Shop {
/// #     type Key = u64;
/// #     fn cache_key(&self) -> u64 { self.id }
/// #     fn cache_prefix() -> &'static str { "shop" }
/// # }
///
/// struct ShopFeeder {
///     id: u64,
///     shop: Option<Shop>,
/// }
///
/// impl CacheFeed<Shop> for ShopFeeder {
///     fn entity_id(&mut self) -> u64 {
///         self.id
///     }
///
///     fn feed(&mut self, entity: Option<Shop>) {
///         self.shop = entity;
///     }
/// }
/// ```
pub trait CacheFeed<T: CacheEntity>: Send {
    /// Primary key to look up.
    fn entity_id(&mut self) -> T::Key;

    /// Store the result. `None` means not found.
    fn feed(&mut self, entity: Option<T>);

    /// Optional: reject the request before touching the cache.
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Optional: called when the cache answered without the repository,
    /// including cached "not found" markers.
    fn on_hit(&mut self, _key: &str) -> Result<()> {
        Ok(())
    }

    /// Optional: called when the cache could not answer on its own.
    fn on_miss(&mut self, _key: &str) -> Result<()> {
        Ok(())
    }

    /// Optional: called with the entity before `feed`, whichever way it
    /// was obtained.
    fn on_loaded(&mut self, _entity: &T) -> Result<()> {
        Ok(())
    }
}

/// Feeder that just holds the requested id and the result.
pub struct GenericFeeder<T: CacheEntity> {
    pub id: T::Key,
    pub data: Option<T>,
}

impl<T: CacheEntity> GenericFeeder<T> {
    pub fn new(id: T::Key) -> Self {
        GenericFeeder { id, data: None }
    }
}

impl<T: CacheEntity> CacheFeed<T> for GenericFeeder<T> {
    fn entity_id(&mut self) -> T::Key {
        self.id.clone()
    }

    fn feed(&mut self, entity: Option<T>) {
        self.data = entity;
    }
}
