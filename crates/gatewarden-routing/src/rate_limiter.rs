//! Fixed-window rate limiting
//!
//! Counts requests per identifier in aligned windows of `window_ms`. Each
//! window has its own store key, `"<key>:<floor(now / window_ms)>"`, which
//! expires after one window length. Bursts at window boundaries are
//! possible and expected.
//!
//! A counter store failure never blocks a request: the check fails open
//! with the full quota remaining.

use chrono::{DateTime, Utc};
use gatewarden_core::clock::{SharedClock, system_clock};
use gatewarden_core::{CounterStore, Result};
use gatewarden_observability::Metrics;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Window length and quota for one limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub window_ms: u64,
    pub max_requests: u64,
}

impl RateLimitConfig {
    pub const fn new(window_ms: u64, max_requests: u64) -> Self {
        Self {
            window_ms,
            max_requests,
        }
    }

    pub const fn per_minute(max_requests: u64) -> Self {
        Self::new(60_000, max_requests)
    }

    pub const fn per_hour(max_requests: u64) -> Self {
        Self::new(3_600_000, max_requests)
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Default quota per scope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitProfiles {
    #[serde(default = "default_api_key")]
    pub api_key: RateLimitConfig,

    #[serde(default = "default_hourly")]
    pub hourly: RateLimitConfig,

    #[serde(default = "default_user")]
    pub user: RateLimitConfig,

    #[serde(default = "default_ip")]
    pub ip: RateLimitConfig,

    /// Applied to routes that carry no quota of their own
    #[serde(default = "default_route")]
    pub route_default: RateLimitConfig,
}

fn default_api_key() -> RateLimitConfig {
    RateLimitConfig::per_minute(100)
}

fn default_hourly() -> RateLimitConfig {
    RateLimitConfig::per_hour(1000)
}

fn default_user() -> RateLimitConfig {
    RateLimitConfig::per_minute(50)
}

fn default_ip() -> RateLimitConfig {
    RateLimitConfig::per_minute(30)
}

fn default_route() -> RateLimitConfig {
    RateLimitConfig::per_minute(100)
}

impl Default for RateLimitProfiles {
    fn default() -> Self {
        Self {
            api_key: default_api_key(),
            hourly: default_hourly(),
            user: default_user(),
            ip: default_ip(),
            route_default: default_route(),
        }
    }
}

/// Outcome of a single check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitResult {
    /// Quota left before this request was counted
    pub remaining: u64,
    /// End of the current window
    pub reset_time: DateTime<Utc>,
    /// Requests recorded in the window, including this one if allowed
    pub total_requests: u64,
    pub blocked: bool,
}

/// Window usage for a key, read without consuming quota
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitStats {
    pub key: String,
    pub count: u64,
    pub remaining: u64,
    pub reset_time: DateTime<Utc>,
    pub window_ms: u64,
    pub max_requests: u64,
}

struct Window {
    store_key: String,
    start_ms: i64,
    reset_time: DateTime<Utc>,
}

/// Rate limiter over a shared counter store
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    profiles: RateLimitProfiles,
    clock: SharedClock,
    metrics: Option<Arc<Metrics>>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, profiles: RateLimitProfiles) -> Self {
        Self::with_clock(store, profiles, system_clock())
    }

    pub fn with_clock(
        store: Arc<dyn CounterStore>,
        profiles: RateLimitProfiles,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            profiles,
            clock,
            metrics: None,
        }
    }

    /// Attach a metrics collector
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn profiles(&self) -> &RateLimitProfiles {
        &self.profiles
    }

    fn window(&self, key: &str, config: &RateLimitConfig) -> Window {
        let window_ms = i64::try_from(config.window_ms.max(1)).unwrap_or(i64::MAX);
        let bucket = self.clock.now_millis().div_euclid(window_ms);
        let reset_ms = (bucket + 1).saturating_mul(window_ms);

        Window {
            store_key: format!("{}:{}", key, bucket),
            start_ms: bucket.saturating_mul(window_ms),
            reset_time: DateTime::from_timestamp_millis(reset_ms).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    /// Count a request against `key`, blocking once the window is full
    pub async fn check_rate_limit(&self, key: &str, config: &RateLimitConfig) -> RateLimitResult {
        let window = self.window(key, config);

        match self.try_consume(&window, config).await {
            Ok(result) => {
                let decision = if result.blocked { "blocked" } else { "allowed" };
                debug!(
                    key = %key,
                    remaining = result.remaining,
                    total = result.total_requests,
                    decision,
                    "Rate limit checked"
                );
                self.record(key, decision);
                result
            }
            Err(e) => {
                error!(key = %key, error = %e, "Rate limit store unavailable, allowing request");
                self.record(key, "fail_open");
                RateLimitResult {
                    remaining: config.max_requests,
                    reset_time: window.reset_time,
                    total_requests: 0,
                    blocked: false,
                }
            }
        }
    }

    async fn try_consume(&self, window: &Window, config: &RateLimitConfig) -> Result<RateLimitResult> {
        let member = uuid::Uuid::new_v4().to_string();
        let count = self
            .store
            .record_if_below(
                &window.store_key,
                &member,
                self.clock.now_millis(),
                window.start_ms,
                config.max_requests,
                config.window(),
            )
            .await?;
        let blocked = count >= config.max_requests;

        Ok(RateLimitResult {
            remaining: config.max_requests.saturating_sub(count),
            reset_time: window.reset_time,
            total_requests: if blocked { count } else { count + 1 },
            blocked,
        })
    }

    fn record(&self, key: &str, decision: &str) {
        if let Some(metrics) = &self.metrics {
            let scope = key.split(':').next().unwrap_or(key);
            metrics.record_rate_limit(scope, decision);
        }
    }

    /// Per-minute limit for an API key
    pub async fn check_api_key_limit(&self, api_key: &str) -> RateLimitResult {
        let config = self.profiles.api_key;
        self.check_rate_limit(&format!("api_key:{}", api_key), &config)
            .await
    }

    /// Per-hour limit for an identifier
    pub async fn check_hourly_limit(&self, identifier: &str) -> RateLimitResult {
        let config = self.profiles.hourly;
        self.check_rate_limit(&format!("hourly:{}", identifier), &config)
            .await
    }

    pub async fn check_user_limit(&self, user_id: &str) -> RateLimitResult {
        let config = self.profiles.user;
        self.check_rate_limit(&format!("user:{}", user_id), &config)
            .await
    }

    pub async fn check_ip_limit(&self, ip: &str) -> RateLimitResult {
        let config = self.profiles.ip;
        self.check_rate_limit(&format!("ip:{}", ip), &config).await
    }

    /// Drop every window recorded for `key`
    pub async fn reset_rate_limit(&self, key: &str) -> Result<u64> {
        let removed = self.store.delete_windows(key).await?;
        debug!(key = %key, removed, "Rate limit reset");
        Ok(removed)
    }

    /// Current window usage for `key`
    pub async fn get_rate_limit_stats(
        &self,
        key: &str,
        config: &RateLimitConfig,
    ) -> Result<RateLimitStats> {
        let window = self.window(key, config);
        let count = self
            .store
            .count_since(&window.store_key, window.start_ms)
            .await?;

        Ok(RateLimitStats {
            key: key.to_string(),
            count,
            remaining: config.max_requests.saturating_sub(count),
            reset_time: window.reset_time,
            window_ms: config.window_ms,
            max_requests: config.max_requests,
        })
    }
}
