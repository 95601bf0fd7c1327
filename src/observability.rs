//! Metrics hooks and TTL policies.

use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;

/// Hooks for cache metrics. Every method defaults to a no-op.
///
/// Implement this to bridge into Prometheus, StatsD or similar.
pub trait CacheMetrics: Send + Sync {
    /// Entity served from the cache without touching the repository.
    fn record_hit(&self, _key: &str, _duration: Duration) {}

    /// Not found, from the null marker or the repository.
    fn record_miss(&self, _key: &str, _duration: Duration) {}

    /// Entity loaded from the repository after a cache miss.
    fn record_load(&self, _key: &str, _duration: Duration) {}

    /// Null marker served without touching the repository.
    fn record_null_hit(&self, _key: &str) {}

    /// Logically expired payload served.
    fn record_stale(&self, _key: &str) {}

    fn record_rebuild_scheduled(&self, _key: &str) {}

    /// Lock was busy and the caller backed off.
    fn record_lock_contention(&self, _key: &str) {}

    fn record_error(&self, _key: &str, _error: &str) {}
}

/// Metrics sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpMetrics;

impl CacheMetrics for NoOpMetrics {}

/// Physical TTL applied to loaded entities.
///
/// `Jittered` spreads expiry of entries loaded together so they do not all
/// expire in the same instant.
#[derive(Clone, Debug, Default)]
pub enum TtlPolicy {
    /// 30 minutes
    #[default]
    Default,
    Fixed(Duration),
    /// Per entity prefix, falling back to `default`.
    PerType {
        ttls: HashMap<String, Duration>,
        default: Duration,
    },
    /// `base` plus a uniformly random extra in `[0, max_jitter]`.
    Jittered { base: Duration, max_jitter: Duration },
}

/// Standard entity TTL used by [`TtlPolicy::Default`].
pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);

impl TtlPolicy {
    /// TTL for an entity with the given cache prefix.
    pub fn get_ttl(&self, prefix: &str) -> Duration {
        match self {
            TtlPolicy::Default => DEFAULT_TTL,
            TtlPolicy::Fixed(ttl) => *ttl,
            TtlPolicy::PerType { ttls, default } => ttls.get(prefix).copied().unwrap_or(*default),
            TtlPolicy::Jittered { base, max_jitter } => {
                let max_ms = u64::try_from(max_jitter.as_millis()).unwrap_or(u64::MAX);
                if max_ms == 0 {
                    return *base;
                }
                let extra = rand::rng().random_range(0..=max_ms);
                *base + Duration::from_millis(extra)
            }
        }
    }

    /// Smallest TTL this policy can produce for any prefix.
    pub fn min_ttl(&self) -> Duration {
        match self {
            TtlPolicy::Default => DEFAULT_TTL,
            TtlPolicy::Fixed(ttl) => *ttl,
            TtlPolicy::PerType { ttls, default } => ttls
                .values()
                .copied()
                .fold(*default, Duration::min),
            TtlPolicy::Jittered { base, .. } => *base,
        }
    }
}
