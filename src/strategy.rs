//! Rebuild policies for cache misses and stale entries.

use std::fmt;

/// How the loader rebuilds a missing or stale entry.
///
/// All three policies cache the repository's "not found" answer as a null
/// marker, so absent keys stop reaching the repository for the null TTL.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum RebuildPolicy {
    /// Load on miss with no coordination between callers.
    ///
    /// Cheapest; concurrent cold misses may all reach the repository.
    #[default]
    PassThrough,

    /// Load on miss under a distributed lock; contenders back off and retry.
    ///
    /// At most one load per key at a time. Callers wait for the load.
    Mutex,

    /// Serve from pre-warmed entries with a logical expiry; refresh stale
    /// entries in the background while serving the stale copy.
    ///
    /// Never blocks and never loads on a cold miss (`warm` first).
    LogicalExpiration,
}

impl fmt::Display for RebuildPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RebuildPolicy::PassThrough => write!(f, "PassThrough"),
            RebuildPolicy::Mutex => write!(f, "Mutex"),
            RebuildPolicy::LogicalExpiration => write!(f, "LogicalExpiration"),
        }
    }
}
