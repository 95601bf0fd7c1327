//! # cache-shield
//!
//! Cache-aside loading over a shared key-value store, with protection
//! against the three classic failure modes:
//!
//! - **Penetration:** lookups for ids that do not exist are cached as a
//!   short-lived null marker, so they stop reaching the database.
//! - **Breakdown:** when a hot key expires, [`RebuildPolicy::Mutex`] lets a
//!   single caller reload it under a distributed lock, and
//!   [`RebuildPolicy::LogicalExpiration`] keeps serving the stale copy while
//!   one background rebuild runs.
//! - **Avalanche:** [`observability::TtlPolicy::Jittered`] spreads the expiry
//!   of entries loaded together.
//!
//! ## Quick Start
//!
//! ```ignore
//! use cache_shield::{
//!     CacheEntity, CacheService, RebuildPolicy,
//!     backend::InMemoryBackend,
//!     repository::InMemoryRepository,
//! };
//!
//! #[derive(Clone, Serialize, Deserialize)]
//! struct Shop {
//!     id: u64,
//!     name: String,
//! }
//!
//! impl CacheEntity for Shop {
//!     type Key = u64;
//!
//!     fn cache_key(&self) -> Self::Key {
//!         self.id
//!     }
//!
//!     fn cache_prefix() -> &'static str {
//!         "shop"
//!     }
//! }
//!
//! let cache = CacheService::new(InMemoryBackend::new());
//! let shop = cache.get::<Shop, _>(&1, &repo, RebuildPolicy::Mutex).await?;
//!
//! // Writes go to the repository first, then evict the cached copy
//! cache.update(&renamed, &repo).await?;
//! ```
//!
//! Logical expiration never loads on a cold miss: call
//! [`CacheService::warm`] for hot keys ahead of time.

#[macro_use]
extern crate log;

pub mod backend;
pub mod builder;
pub mod config;
pub mod entity;
pub mod error;
pub mod feed;
pub mod invalidator;
pub mod key;
pub mod loader;
pub mod lock;
pub mod observability;
pub mod rebuild;
pub mod repository;
pub mod serialization;
pub mod service;
pub mod strategy;

// Re-exports for convenience
pub use backend::CacheBackend;
pub use builder::CacheOperationBuilder;
pub use config::{ExecutorConfig, LoaderConfig};
pub use entity::CacheEntity;
pub use error::{Error, Result};
pub use feed::CacheFeed;
pub use invalidator::Invalidator;
pub use loader::{CacheAsideLoader, OperationConfig};
pub use repository::DataRepository;
pub use service::CacheService;
pub use strategy::RebuildPolicy;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
