//! In-memory counter store
//!
//! Implements [`CounterStore`] for single-node deployments and tests.
//! Keys hold scored members; a key past its expiry reads as empty and is
//! dropped on the next access.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use gatewarden_core::clock::{SharedClock, saturating_add, system_clock};
use gatewarden_core::{CounterStore, Result, is_window_key};
use std::time::Duration;

#[derive(Debug, Default)]
struct ScoredSet {
    members: Vec<(String, i64)>,
    expires_at: Option<DateTime<Utc>>,
}

impl ScoredSet {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    fn count_since(&self, min_score: i64) -> u64 {
        self.members
            .iter()
            .filter(|(_, score)| *score >= min_score)
            .count() as u64
    }
}

/// Counter store backed by a concurrent map
pub struct MemoryCounterStore {
    sets: DashMap<String, ScoredSet>,
    clock: SharedClock,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            sets: DashMap::new(),
            clock,
        }
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.sets.iter().filter(|set| !set.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired key
    pub fn purge_expired(&self) {
        let now = self.clock.now();
        self.sets.retain(|_, set| !set.is_expired(now));
    }
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn record_if_below(
        &self,
        key: &str,
        member: &str,
        score: i64,
        min_score: i64,
        limit: u64,
        ttl: Duration,
    ) -> Result<u64> {
        let now = self.clock.now();
        // The entry guard holds the shard lock until the member is recorded
        let mut set = self.sets.entry(key.to_string()).or_default();
        if set.is_expired(now) {
            *set = ScoredSet::default();
        }

        let count = set.count_since(min_score);
        if count < limit {
            set.members.retain(|(existing, _)| existing != member);
            set.members.push((member.to_string(), score));
            set.expires_at = Some(saturating_add(now, ttl));
        }
        Ok(count)
    }

    async fn count_since(&self, key: &str, min_score: i64) -> Result<u64> {
        let now = self.clock.now();
        let count = match self.sets.get(key) {
            Some(set) if !set.is_expired(now) => set.count_since(min_score),
            _ => 0,
        };
        Ok(count)
    }

    async fn delete_windows(&self, base: &str) -> Result<u64> {
        let before = self.sets.len();
        self.sets.retain(|key, _| !is_window_key(key, base));
        Ok(before.saturating_sub(self.sets.len()) as u64)
    }
}
