//! Core entity trait that all cached entities must implement.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::hash::Hash;

/// Trait that all entities stored in cache must implement.
///
/// # Example
///
/// ```
/// use serde::{Deserialize, Serialize};
/// use cache_shield::CacheEntity;
///
/// #[derive(Clone, Serialize, Deserialize)]
/// pub struct Shop {
///     pub id: u64,
///     pub name: String,
/// }
///
/// impl CacheEntity for Shop {
///     type Key = u64;
///
///     fn cache_key(&self) -> Self::Key {
///         self.id
///     }
///
///     fn cache_prefix() -> &'static str {
///         "shop"
///     }
/// }
/// ```
pub trait CacheEntity:
    Send + Sync + Serialize + for<'de> Deserialize<'de> + Clone + 'static
{
    /// Type of the entity's primary key.
    type Key: Display + Clone + Send + Sync + Eq + Hash + 'static;

    /// Return the entity's primary key.
    ///
    /// The invalidator uses it to find the cache key to evict after a write.
    fn cache_key(&self) -> Self::Key;

    /// Entity type segment of the cache key.
    ///
    /// Final data key: `"{namespace}:{prefix}:{key}"`, lock key:
    /// `"lock:{prefix}:{key}"`. Must be unique per entity type.
    fn cache_prefix() -> &'static str;

    /// Optional: Validate entity after loading or before writing.
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}
