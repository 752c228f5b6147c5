//! Shared counter store trait
//!
//! The rate limiter keeps its window counters in an external store with
//! Redis-like sorted-set semantics. This trait is the narrow seam the
//! limiter depends on; implementations may be in-process or remote.

use async_trait::async_trait;
use std::time::Duration;

use crate::Result;

/// Key/value store with scored members and per-key expiry
///
/// Implementations:
/// - `MemoryCounterStore` (gatewarden-routing): in-process store for single-node deployments and tests
///
/// Any failure must be reported as `Error::StoreUnavailable`; callers decide
/// whether to fail open.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Count the members of `key` scored at or above `min_score` and, when
    /// that count is below `limit`, add `member` with `score` and expire the
    /// key after `ttl`
    ///
    /// Counting and adding happen as one step with respect to other callers
    /// on the same key. Returns the count observed before adding.
    async fn record_if_below(
        &self,
        key: &str,
        member: &str,
        score: i64,
        min_score: i64,
        limit: u64,
        ttl: Duration,
    ) -> Result<u64>;

    /// Count the members of `key` whose score is greater than or equal to `min_score`
    async fn count_since(&self, key: &str, min_score: i64) -> Result<u64>;

    /// Delete every window key `"<base>:<bucket>"` with an integer bucket,
    /// returning how many were removed
    async fn delete_windows(&self, base: &str) -> Result<u64>;
}

/// Whether `key` is `"<base>:<bucket>"` for an integer bucket
pub fn is_window_key(key: &str, base: &str) -> bool {
    let Some(bucket) = key
        .strip_prefix(base)
        .and_then(|rest| rest.strip_prefix(':'))
    else {
        return false;
    };
    let digits = bucket.strip_prefix('-').unwrap_or(bucket);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}
