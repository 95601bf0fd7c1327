//! Loader and executor configuration.
//!
//! Defaults follow the usual cache-aside constants: entities live 30 minutes,
//! null markers 2 minutes, lock leases 10 seconds, and contenders back off
//! 50 ms between attempts. Every value can be overridden from the
//! environment with [`LoaderConfig::from_env`].

use crate::error::{Error, Result};
use crate::key::{DEFAULT_NAMESPACE, LOCK_NAMESPACE};
use crate::observability::TtlPolicy;
use crate::serialization::EntryFormat;
use std::str::FromStr;
use std::time::Duration;

/// Settings for [`crate::CacheAsideLoader`].
#[derive(Clone, Debug)]
pub struct LoaderConfig {
    /// First segment of data keys.
    pub namespace: String,
    /// Physical TTL of loaded entities.
    pub ttl_policy: TtlPolicy,
    /// Physical TTL of null markers. Must be shorter than the entity TTL.
    pub null_ttl: Duration,
    pub lock_lease: Duration,
    /// Sleep between lock attempts under the mutex policy.
    pub lock_retry_backoff: Duration,
    /// Total lock attempts before `Error::LockContention`.
    pub max_lock_attempts: u32,
    /// How long a rebuilt entry stays logically fresh.
    pub logical_window: Duration,
    /// Physical TTL of logically expiring entries. `None` keeps stale copies
    /// servable until they are rebuilt or invalidated.
    pub logical_physical_ttl: Option<Duration>,
    pub entry_format: EntryFormat,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        LoaderConfig {
            namespace: DEFAULT_NAMESPACE.to_string(),
            ttl_policy: TtlPolicy::Default,
            null_ttl: Duration::from_secs(2 * 60),
            lock_lease: Duration::from_secs(10),
            lock_retry_backoff: Duration::from_millis(50),
            max_lock_attempts: 20,
            logical_window: Duration::from_secs(30),
            logical_physical_ttl: None,
            entry_format: EntryFormat::Binary,
        }
    }
}

impl LoaderConfig {
    /// Defaults overridden by environment variables:
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `CACHE_NAMESPACE` | `namespace` |
    /// | `CACHE_TTL_SECS` | `ttl_policy` (fixed) |
    /// | `CACHE_NULL_TTL_SECS` | `null_ttl` |
    /// | `CACHE_LOCK_LEASE_SECS` | `lock_lease` |
    /// | `CACHE_LOCK_BACKOFF_MS` | `lock_retry_backoff` |
    /// | `CACHE_LOCK_MAX_ATTEMPTS` | `max_lock_attempts` |
    /// | `CACHE_LOGICAL_WINDOW_SECS` | `logical_window` |
    ///
    /// # Errors
    ///
    /// `Error::ConfigError` if a variable does not parse or the result fails
    /// [`LoaderConfig::validate`].
    pub fn from_env() -> Result<Self> {
        let mut config = LoaderConfig::default();

        if let Ok(ns) = std::env::var("CACHE_NAMESPACE") {
            config.namespace = ns;
        }
        if let Some(secs) = env_parse::<u64>("CACHE_TTL_SECS")? {
            config.ttl_policy = TtlPolicy::Fixed(Duration::from_secs(secs));
        }
        if let Some(secs) = env_parse::<u64>("CACHE_NULL_TTL_SECS")? {
            config.null_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("CACHE_LOCK_LEASE_SECS")? {
            config.lock_lease = Duration::from_secs(secs);
        }
        if let Some(ms) = env_parse::<u64>("CACHE_LOCK_BACKOFF_MS")? {
            config.lock_retry_backoff = Duration::from_millis(ms);
        }
        if let Some(attempts) = env_parse::<u32>("CACHE_LOCK_MAX_ATTEMPTS")? {
            config.max_lock_attempts = attempts;
        }
        if let Some(secs) = env_parse::<u64>("CACHE_LOGICAL_WINDOW_SECS")? {
            config.logical_window = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() || self.namespace.contains(':') {
            return Err(Error::ConfigError(format!(
                "namespace must be non-empty and contain no ':' (got {:?})",
                self.namespace
            )));
        }
        if self.namespace == LOCK_NAMESPACE {
            return Err(Error::ConfigError(
                "namespace 'lock' is reserved for lock keys".to_string(),
            ));
        }
        if self.null_ttl.is_zero() {
            return Err(Error::ConfigError("null_ttl must be positive".to_string()));
        }
        self.check_entity_ttl(self.ttl_policy.min_ttl())?;
        if self.lock_lease.is_zero() {
            return Err(Error::ConfigError("lock_lease must be positive".to_string()));
        }
        if self.max_lock_attempts == 0 {
            return Err(Error::ConfigError(
                "max_lock_attempts must be at least 1".to_string(),
            ));
        }
        if self.logical_window.is_zero() {
            return Err(Error::ConfigError(
                "logical_window must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Entity TTLs must outlive null markers.
    pub(crate) fn check_entity_ttl(&self, ttl: Duration) -> Result<()> {
        if self.null_ttl >= ttl {
            return Err(Error::ConfigError(format!(
                "null_ttl ({:?}) must be shorter than the entity TTL ({:?})",
                self.null_ttl, ttl
            )));
        }
        Ok(())
    }
}

/// Settings for [`crate::rebuild::RebuildExecutor`].
#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            workers: 10,
            queue_capacity: 1024,
        }
    }
}

impl ExecutorConfig {
    /// Defaults overridden by `REBUILD_WORKERS` and `REBUILD_QUEUE_CAPACITY`.
    pub fn from_env() -> Result<Self> {
        let mut config = ExecutorConfig::default();
        if let Some(workers) = env_parse::<usize>("REBUILD_WORKERS")? {
            config.workers = workers;
        }
        if let Some(capacity) = env_parse::<usize>("REBUILD_QUEUE_CAPACITY")? {
            config.queue_capacity = capacity;
        }
        if config.workers == 0 || config.queue_capacity == 0 {
            return Err(Error::ConfigError(
                "rebuild workers and queue capacity must be positive".to_string(),
            ));
        }
        Ok(config)
    }
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::ConfigError(format!("{} has invalid value {:?}", name, raw))),
        Err(_) => Ok(None),
    }
}
