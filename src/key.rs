//! Cache and lock key construction.

use crate::entity::CacheEntity;
use std::fmt::Display;

/// Namespace reserved for lock keys.
pub const LOCK_NAMESPACE: &str = "lock";

/// Default namespace for data keys.
pub const DEFAULT_NAMESPACE: &str = "cache";

/// Builds data and lock keys for an entity type.
///
/// ```
/// use cache_shield::key::CacheKeyBuilder;
/// # use cache_shield::CacheEntity;
/// # use serde::{Deserialize, Serialize};
/// # #[derive(Clone, Serialize, Deserialize)]
/// # struct Shop { id: u64 }
/// # impl CacheEntity for Shop {
/// #     type Key = u64;
/// #     fn cache_key(&self) -> u64 { self.id }
/// #     fn cache_prefix() -> &'static str { "shop" }
/// # }
/// assert_eq!(CacheKeyBuilder::data::<Shop>("cache", &7), "cache:shop:7");
/// assert_eq!(CacheKeyBuilder::lock::<Shop>(&7), "lock:shop:7");
/// ```
pub struct CacheKeyBuilder;

impl CacheKeyBuilder {
    /// Data key: `"{namespace}:{prefix}:{id}"`.
    pub fn data<T: CacheEntity>(namespace: &str, id: &impl Display) -> String {
        format!("{}:{}:{}", namespace, T::cache_prefix(), id)
    }

    /// Lock key: `"lock:{prefix}:{id}"`.
    pub fn lock<T: CacheEntity>(id: &impl Display) -> String {
        format!("{}:{}:{}", LOCK_NAMESPACE, T::cache_prefix(), id)
    }
}
