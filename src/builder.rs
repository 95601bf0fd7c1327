//! Builder pattern for cache operations with per-call overrides.

use crate::backend::CacheBackend;
use crate::error::Result;
use crate::loader::OperationConfig;
use crate::strategy::RebuildPolicy;
use crate::{CacheAsideLoader, CacheEntity, CacheFeed, DataRepository};
use std::time::Duration;

/// Fluent builder for a single cache operation.
///
/// # Example
///
/// ```ignore
/// loader
///     .builder()
///     .with_policy(RebuildPolicy::Mutex)
///     .with_ttl(Duration::from_secs(300))
///     .with_retry(3)
///     .execute(&mut feeder, &repo).await?;
/// ```
pub struct CacheOperationBuilder<'a, B: CacheBackend> {
    loader: &'a CacheAsideLoader<B>,
    policy: RebuildPolicy,
    op: OperationConfig,
    retry_count: u32,
}

impl<'a, B: CacheBackend> CacheOperationBuilder<'a, B> {
    pub(crate) fn new(loader: &'a CacheAsideLoader<B>) -> Self {
        Self {
            loader,
            policy: RebuildPolicy::default(),
            op: OperationConfig::default(),
            retry_count: 0,
        }
    }

    pub fn with_policy(mut self, policy: RebuildPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Override the entity TTL for this operation only.
    ///
    /// Null markers keep the loader's null TTL; logical-expiration reads
    /// ignore the override. The override must be longer than the null TTL,
    /// otherwise the operation fails with `Error::ConfigError`.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.op.ttl = Some(ttl);
        self
    }

    /// Retry up to `count` more times on retryable errors
    /// (store unavailable, lock contention).
    pub fn with_retry(mut self, count: u32) -> Self {
        self.retry_count = count;
        self
    }

    /// Execute a feeder operation.
    ///
    /// # Errors
    ///
    /// The last error once retries are exhausted, or the first
    /// non-retryable error. See [`CacheAsideLoader::with`].
    pub async fn execute<T, F, R>(self, feeder: &mut F, repository: &R) -> Result<()>
    where
        T: CacheEntity,
        F: CacheFeed<T>,
        R: DataRepository<T>,
    {
        self.check_overrides()?;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .loader
                .execute::<T, F, R>(feeder, repository, self.policy, &self.op)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) => self.backoff(attempt, e).await?,
            }
        }
    }

    /// Like [`execute`](Self::execute) but returns the entity.
    pub async fn get<T, R>(self, id: &T::Key, repository: &R) -> Result<Option<T>>
    where
        T: CacheEntity,
        R: DataRepository<T>,
    {
        self.check_overrides()?;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .loader
                .load::<T, R>(id, repository, self.policy, &self.op)
                .await
            {
                Ok(served) => return Ok(served.into_option()),
                Err(e) => self.backoff(attempt, e).await?,
            }
        }
    }

    fn check_overrides(&self) -> Result<()> {
        match self.op.ttl {
            Some(ttl) => self.loader.config.check_entity_ttl(ttl),
            None => Ok(()),
        }
    }

    /// Sleep before the next attempt, or hand back the error if there is none.
    async fn backoff(&self, attempt: u32, error: crate::Error) -> Result<()> {
        let max_attempts = self.retry_count + 1;
        if attempt >= max_attempts || !error.is_retryable() {
            return Err(error);
        }

        debug!(
            "Cache operation failed (attempt {}/{}): {}, retrying...",
            attempt, max_attempts, error
        );
        let delay = Duration::from_millis(100 * 2_u64.pow(attempt - 1));
        tokio::time::sleep(delay).await;
        Ok(())
    }
}
