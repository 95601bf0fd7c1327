//! Memcached cache backend implementation.

use super::CacheBackend;
use crate::error::{Error, Result};
use async_memcached::{AsciiProtocol, Status};
use deadpool_memcached::{Manager, Object, Pool};
use std::time::Duration;

/// Default Memcached connection pool size.
/// Override with MEMCACHED_POOL_SIZE environment variable
const DEFAULT_POOL_SIZE: u32 = 16;

/// Configuration for Memcached backend.
#[derive(Clone, Debug)]
pub struct MemcachedConfig {
    pub servers: Vec<String>, // only the first server is used
    pub connection_timeout: Duration,
    pub pool_size: u32,
}

impl Default for MemcachedConfig {
    fn default() -> Self {
        MemcachedConfig {
            servers: vec!["localhost:11211".to_string()],
            connection_timeout: Duration::from_secs(5),
            pool_size: 10,
        }
    }
}

/// Memcached backend with connection pooling.
///
/// `set_if_absent` maps to the atomic `add` command. Memcached expiry has
/// one-second granularity, so sub-second TTLs round up to one second.
#[derive(Clone)]
pub struct MemcachedBackend {
    pool: Pool,
}

impl MemcachedBackend {
    /// Create new Memcached backend from configuration.
    ///
    /// # Errors
    /// Returns `Err` if no server is configured or pool creation fails
    pub async fn new(config: MemcachedConfig) -> Result<Self> {
        let addr = config
            .servers
            .first()
            .ok_or_else(|| Error::ConfigError("No memcached servers specified".to_string()))?
            .clone();

        let pool = Pool::builder(Manager::new(addr.clone()))
            .max_size(config.pool_size as usize)
            .build()
            .map_err(|e| Error::ConfigError(format!("Failed to create connection pool: {}", e)))?;

        info!(
            "✓ Memcached backend initialized with server: {} (pool size: {})",
            addr, config.pool_size
        );

        Ok(MemcachedBackend { pool })
    }

    /// Create from server address, sizing the pool from `MEMCACHED_POOL_SIZE`.
    pub async fn from_server(addr: String) -> Result<Self> {
        let pool_size = std::env::var("MEMCACHED_POOL_SIZE")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(DEFAULT_POOL_SIZE);

        Self::new(MemcachedConfig {
            servers: vec![addr],
            pool_size,
            ..Default::default()
        })
        .await
    }

    async fn connection(&self) -> Result<Object> {
        self.pool.get().await.map_err(|e| {
            Error::StoreUnavailable(format!("Failed to get Memcached connection: {}", e))
        })
    }
}

fn expiry_secs(ttl: Duration) -> i64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    i64::try_from(secs.max(1)).unwrap_or(i64::MAX)
}

impl CacheBackend for MemcachedBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.connection().await?;

        match conn.get(key).await {
            Ok(found) => {
                let data = found.and_then(|value| value.data);
                debug!(
                    "✓ Memcached GET {} -> {}",
                    key,
                    if data.is_some() { "HIT" } else { "MISS" }
                );
                Ok(data)
            }
            Err(e) => Err(Error::StoreUnavailable(format!(
                "Memcached GET failed for key {}: {}",
                key, e
            ))),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.connection().await?;

        conn.set(key, value.as_slice(), ttl.map(expiry_secs), None)
            .await
            .map_err(|e| {
                Error::StoreUnavailable(format!("Memcached SET failed for key {}: {}", key, e))
            })?;

        debug!("✓ Memcached SET {} (TTL: {:?})", key, ttl);
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection().await?;

        match conn
            .add(key, value.as_slice(), Some(expiry_secs(ttl)), None)
            .await
        {
            Ok(()) => {
                debug!("✓ Memcached ADD {} -> stored", key);
                Ok(true)
            }
            Err(async_memcached::Error::Protocol(Status::NotStored)) => {
                debug!("✓ Memcached ADD {} -> exists", key);
                Ok(false)
            }
            Err(e) => Err(Error::StoreUnavailable(format!(
                "Memcached ADD failed for key {}: {}",
                key, e
            ))),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.connection().await?;

        match conn.delete(key).await {
            Ok(()) | Err(async_memcached::Error::Protocol(Status::NotFound)) => {
                debug!("✓ Memcached DELETE {}", key);
                Ok(())
            }
            Err(e) => Err(Error::StoreUnavailable(format!(
                "Memcached DELETE failed for key {}: {}",
                key, e
            ))),
        }
    }

    async fn health_check(&self) -> Result<bool> {
        match self.pool.get().await {
            Ok(mut conn) => Ok(conn.get("__health_check__").await.is_ok()),
            Err(_) => Ok(false),
        }
    }
}
