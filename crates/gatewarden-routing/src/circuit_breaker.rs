//! Circuit Breaker Implementation
//!
//! Implements the circuit breaker pattern to prevent cascade failures.
//! Breakers are keyed by call name and created lazily on first use.
//! Each breaker has three states:
//! - Closed: Normal operation, calls pass through
//! - Open: Error rate too high, calls are short-circuited
//! - HalfOpen: Cool-down elapsed, calls are admitted to test recovery
//!
//! State transitions:
//! - Closed → Open: `total >= volume_threshold` and error rate at or above threshold
//! - Open → HalfOpen: First call at or after `next_attempt_time`
//! - HalfOpen → Closed: Any success
//! - HalfOpen → Open: A failure that meets the same threshold condition

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use gatewarden_core::clock::{SharedClock, saturating_add, system_clock};
use gatewarden_core::{Error, Result};
use gatewarden_observability::{CircuitBreakerState, Metrics};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation - calls pass through
    #[default]
    Closed,
    /// Failing - calls short-circuited
    Open,
    /// Testing recovery
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

impl From<CircuitState> for CircuitBreakerState {
    fn from(state: CircuitState) -> Self {
        match state {
            CircuitState::Closed => CircuitBreakerState::Closed,
            CircuitState::Open => CircuitBreakerState::Open,
            CircuitState::HalfOpen => CircuitBreakerState::HalfOpen,
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Upper bound on a single protected call, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Error rate (percent) at which the circuit opens
    #[serde(default = "default_error_threshold_percentage")]
    pub error_threshold_percentage: f64,

    /// Cool-down before an open circuit admits calls again, in milliseconds
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,

    /// Minimum number of calls before the error rate is considered
    #[serde(default = "default_volume_threshold")]
    pub volume_threshold: u64,
}

fn default_timeout_ms() -> u64 {
    3000
}

fn default_error_threshold_percentage() -> f64 {
    50.0
}

fn default_reset_timeout_ms() -> u64 {
    30_000
}

fn default_volume_threshold() -> u64 {
    10
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            error_threshold_percentage: default_error_threshold_percentage(),
            reset_timeout_ms: default_reset_timeout_ms(),
            volume_threshold: default_volume_threshold(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

/// Point-in-time view of one breaker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u64,
    pub success_count: u64,
    pub fallback_count: u64,
    pub total_count: u64,
    /// Failures as a percentage of total calls
    pub error_rate: f64,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub next_attempt_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Counters {
    state: CircuitState,
    failure_count: u64,
    success_count: u64,
    fallback_count: u64,
    total_count: u64,
    last_failure_time: Option<DateTime<Utc>>,
    next_attempt_time: Option<DateTime<Utc>>,
}

impl Counters {
    fn state(&self) -> CircuitState {
        self.state
    }

    fn error_rate(&self) -> f64 {
        if self.total_count == 0 {
            0.0
        } else {
            self.failure_count as f64 / self.total_count as f64 * 100.0
        }
    }
}

enum Admission {
    Proceed,
    ShortCircuit,
}

/// A single named breaker
///
/// All state lives behind one mutex so every transition is linearizable
/// per name. The lock is never held across an await point.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    counters: Mutex<Counters>,
}

impl CircuitBreaker {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            counters: Mutex::new(Counters::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state()
    }

    pub fn stats(&self) -> CircuitStats {
        let counters = self.lock();
        CircuitStats {
            name: self.name.clone(),
            state: counters.state(),
            failure_count: counters.failure_count,
            success_count: counters.success_count,
            fallback_count: counters.fallback_count,
            total_count: counters.total_count,
            error_rate: counters.error_rate(),
            last_failure_time: counters.last_failure_time,
            next_attempt_time: counters.next_attempt_time,
        }
    }
}

/// Registry of named circuit breakers
pub struct CircuitBreakerRegistry {
    circuits: DashMap<String, Arc<CircuitBreaker>>,
    config: CircuitBreakerConfig,
    clock: SharedClock,
    metrics: Option<Arc<Metrics>>,
}

impl CircuitBreakerRegistry {
    /// Create a registry backed by the system clock
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        Self {
            circuits: DashMap::new(),
            config,
            clock,
            metrics: None,
        }
    }

    /// Attach a metrics collector
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get or create the breaker for a name
    pub fn circuit(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.circuits.get(name) {
            return existing.clone();
        }
        self.circuits
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(circuit = %name, "Creating circuit breaker");
                if let Some(metrics) = &self.metrics {
                    metrics.update_circuit_breaker_state(name, CircuitBreakerState::Closed);
                }
                Arc::new(CircuitBreaker::new(name))
            })
            .clone()
    }

    /// Run `call` through the breaker for `name`
    ///
    /// Short-circuits with `Error::CircuitOpen` while the circuit is open.
    pub async fn execute<T, F, Fut>(&self, name: &str, call: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run(name, call, None::<fn() -> std::future::Ready<Result<T>>>)
            .await
    }

    /// Run `call` through the breaker for `name`, using `fallback` when the
    /// circuit is open or the call fails
    pub async fn execute_with_fallback<T, F, Fut, FB, FBFut>(
        &self,
        name: &str,
        call: F,
        fallback: FB,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
        FB: FnOnce() -> FBFut,
        FBFut: Future<Output = Result<T>>,
    {
        self.run(name, call, Some(fallback)).await
    }

    async fn run<T, F, Fut, FB, FBFut>(
        &self,
        name: &str,
        call: F,
        fallback: Option<FB>,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
        FB: FnOnce() -> FBFut,
        FBFut: Future<Output = Result<T>>,
    {
        let circuit = self.circuit(name);

        if let Admission::ShortCircuit = self.admit(&circuit) {
            if let Some(metrics) = &self.metrics {
                metrics.record_fallback(name);
            }
            return match fallback {
                Some(fallback) => fallback().await,
                None => Err(Error::CircuitOpen(name.to_string())),
            };
        }

        let outcome = match tokio::time::timeout(self.config.timeout(), call()).await {
            Ok(result) => result,
            Err(_) => Err(Error::BackendFailure(format!(
                "call '{}' timed out after {}ms",
                name, self.config.timeout_ms
            ))),
        };

        match outcome {
            Ok(value) => {
                self.on_success(&circuit);
                Ok(value)
            }
            Err(err) => {
                debug!(circuit = %name, error = %err, "Protected call failed");
                self.on_failure(&circuit);
                match fallback {
                    Some(fallback) => fallback().await,
                    None => Err(err),
                }
            }
        }
    }

    fn admit(&self, circuit: &CircuitBreaker) -> Admission {
        let now = self.clock.now();
        let mut counters = circuit.lock();

        if counters.state() == CircuitState::Open {
            let cooling = counters.next_attempt_time.is_some_and(|next| now < next);
            if cooling {
                counters.fallback_count += 1;
                return Admission::ShortCircuit;
            }
            self.transition(circuit, &mut counters, CircuitState::HalfOpen);
        }

        Admission::Proceed
    }

    fn on_success(&self, circuit: &CircuitBreaker) {
        let mut counters = circuit.lock();
        counters.success_count += 1;
        counters.total_count += 1;

        if counters.state() == CircuitState::HalfOpen {
            counters.failure_count = 0;
            self.transition(circuit, &mut counters, CircuitState::Closed);
        }
    }

    fn on_failure(&self, circuit: &CircuitBreaker) {
        let now = self.clock.now();
        let mut counters = circuit.lock();
        counters.failure_count += 1;
        counters.total_count += 1;
        counters.last_failure_time = Some(now);

        if counters.state() == CircuitState::Open {
            return;
        }

        if counters.total_count >= self.config.volume_threshold
            && counters.error_rate() >= self.config.error_threshold_percentage
        {
            counters.next_attempt_time = Some(saturating_add(now, self.config.reset_timeout()));
            self.transition(circuit, &mut counters, CircuitState::Open);
        }
    }

    fn transition(&self, circuit: &CircuitBreaker, counters: &mut Counters, to: CircuitState) {
        let from = counters.state();
        counters.state = to;

        match to {
            CircuitState::Open => warn!(
                circuit = %circuit.name,
                failures = counters.failure_count,
                total = counters.total_count,
                error_rate = counters.error_rate(),
                "Circuit breaker opened"
            ),
            CircuitState::HalfOpen => {
                info!(circuit = %circuit.name, "Circuit breaker half-open (testing recovery)")
            }
            CircuitState::Closed => {
                info!(circuit = %circuit.name, "Circuit breaker closed (recovered)")
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_circuit_breaker_transition(&circuit.name, from.into(), to.into());
        }
    }

    /// Stats for one breaker, if it has been used
    pub fn get_stats(&self, name: &str) -> Option<CircuitStats> {
        self.circuits.get(name).map(|circuit| circuit.stats())
    }

    /// Stats for every known breaker, sorted by name
    pub fn get_all_stats(&self) -> Vec<CircuitStats> {
        let mut stats: Vec<CircuitStats> = self
            .circuits
            .iter()
            .map(|entry| entry.value().stats())
            .collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Current state of a breaker; unknown names are closed
    pub fn state(&self, name: &str) -> CircuitState {
        self.circuits
            .get(name)
            .map(|circuit| circuit.state())
            .unwrap_or(CircuitState::Closed)
    }

    /// Force a breaker back to CLOSED with every counter zeroed
    pub fn reset_circuit(&self, name: &str) {
        let circuit = self.circuit(name);
        let mut counters = circuit.lock();
        let from = counters.state();
        *counters = Counters::default();
        info!(circuit = %name, "Circuit breaker reset");

        if let Some(metrics) = &self.metrics
            && from != CircuitState::Closed
        {
            metrics.record_circuit_breaker_transition(name, from.into(), CircuitState::Closed.into());
        }
    }

    /// Retry a call through the breaker with linear backoff
    ///
    /// Sleeps `base_delay * attempt` between attempts and returns the last
    /// error once `max_retries` attempts have failed.
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        name: &str,
        mut call: F,
        max_retries: u32,
        base_delay: Duration,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = max_retries.max(1);
        let mut attempt = 1;

        loop {
            match self.execute(name, &mut call).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= attempts => return Err(err),
                Err(err) => {
                    debug!(circuit = %name, attempt, error = %err, "Retrying protected call");
                    tokio::time::sleep(base_delay * attempt).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Execute with a fallback, and fall back again if that still fails
    pub async fn execute_with_graceful_degradation<T, F, Fut, FB, FBFut>(
        &self,
        name: &str,
        call: F,
        fallback: FB,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
        FB: Fn() -> FBFut,
        FBFut: Future<Output = Result<T>>,
    {
        match self.execute_with_fallback(name, call, &fallback).await {
            Ok(value) => Ok(value),
            Err(err) => {
                warn!(circuit = %name, error = %err, "Fallback failed, degrading directly");
                fallback().await
            }
        }
    }
}

/// Wrapper that can be shared across tasks
pub type SharedCircuitBreakerRegistry = Arc<CircuitBreakerRegistry>;

#[cfg(test)]
mod tests {
    use super::*;
    use gatewarden_core::ManualClock;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn registry_with_clock() -> (CircuitBreakerRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_millis(1_000_000));
        let registry = CircuitBreakerRegistry::with_clock(CircuitBreakerConfig::default(), clock.clone());
        (registry, clock)
    }

    async fn succeed(registry: &CircuitBreakerRegistry, name: &str) {
        let result = registry.execute(name, || async { Ok::<_, Error>(1) }).await;
        assert!(result.is_ok());
    }

    async fn fail(registry: &CircuitBreakerRegistry, name: &str) -> Error {
        registry
            .execute(name, || async {
                Err::<i32, _>(Error::BackendFailure("boom".to_string()))
            })
            .await
            .unwrap_err()
    }

    #[tokio::test]
    async fn test_initial_state_is_closed() {
        let (registry, _) = registry_with_clock();
        assert_eq!(registry.state("svc"), CircuitState::Closed);
        assert!(registry.get_stats("svc").is_none());

        succeed(&registry, "svc").await;
        let stats = registry.get_stats("svc").unwrap();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.success_count, 1);
        assert_eq!(stats.total_count, 1);
    }

    #[tokio::test]
    async fn test_opens_at_half_error_rate() {
        let (registry, _) = registry_with_clock();
        for _ in 0..5 {
            succeed(&registry, "svc").await;
        }
        for _ in 0..5 {
            fail(&registry, "svc").await;
        }

        let stats = registry.get_stats("svc").unwrap();
        assert_eq!(stats.state, CircuitState::Open);
        assert_eq!(stats.total_count, 10);
        assert_eq!(stats.failure_count, 5);
        assert!(stats.next_attempt_time.is_some());
    }

    #[tokio::test]
    async fn test_stays_closed_below_error_rate() {
        let (registry, _) = registry_with_clock();
        for _ in 0..6 {
            succeed(&registry, "svc").await;
        }
        for _ in 0..4 {
            fail(&registry, "svc").await;
        }

        let stats = registry.get_stats("svc").unwrap();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.total_count, 10);
        assert_eq!(stats.error_rate, 40.0);
    }

    #[tokio::test]
    async fn test_stays_closed_below_volume_threshold() {
        let (registry, _) = registry_with_clock();
        for _ in 0..9 {
            fail(&registry, "svc").await;
        }
        assert_eq!(registry.state("svc"), CircuitState::Closed);

        fail(&registry, "svc").await;
        assert_eq!(registry.state("svc"), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_interleaved_successes_keep_failure_count() {
        let (registry, _) = registry_with_clock();
        for _ in 0..5 {
            fail(&registry, "svc").await;
            succeed(&registry, "svc").await;
        }

        let stats = registry.get_stats("svc").unwrap();
        assert_eq!(stats.failure_count, 5);
        assert_eq!(stats.total_count, 10);
        assert_eq!(stats.state, CircuitState::Closed);

        // The 11th call, a failure, pushes the rate over 50%
        fail(&registry, "svc").await;
        assert_eq!(registry.state("svc"), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_recovery_resets_failure_count_only() {
        let (registry, clock) = registry_with_clock();
        for _ in 0..10 {
            fail(&registry, "svc").await;
        }
        clock.advance(Duration::from_secs(30));
        succeed(&registry, "svc").await;

        let stats = registry.get_stats("svc").unwrap();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failure_count, 0);
        assert_eq!(stats.success_count, 1);
        assert_eq!(stats.total_count, 11);
    }

    #[tokio::test]
    async fn test_open_short_circuits_until_reset_timeout() {
        let (registry, clock) = registry_with_clock();
        for _ in 0..10 {
            fail(&registry, "svc").await;
        }
        assert_eq!(registry.state("svc"), CircuitState::Open);

        let invoked = &AtomicU32::new(0);
        let err = registry
            .execute("svc", move || async move {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Error>(1)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CircuitOpen(ref name) if name == "svc"));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(registry.get_stats("svc").unwrap().fallback_count, 1);

        clock.advance(Duration::from_millis(29_999));
        assert!(matches!(fail(&registry, "svc").await, Error::CircuitOpen(_)));

        clock.advance(Duration::from_millis(1));
        succeed(&registry, "svc").await;
        assert_eq!(registry.state("svc"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_unbounded_reset_timeout_stays_open() {
        let clock = Arc::new(ManualClock::at_millis(1_000_000));
        let config = CircuitBreakerConfig {
            reset_timeout_ms: u64::MAX,
            ..Default::default()
        };
        let registry = CircuitBreakerRegistry::with_clock(config, clock.clone());

        for _ in 0..10 {
            fail(&registry, "svc").await;
        }
        let stats = registry.get_stats("svc").unwrap();
        assert_eq!(stats.state, CircuitState::Open);
        assert_eq!(stats.next_attempt_time, Some(DateTime::<Utc>::MAX_UTC));

        clock.advance(Duration::from_secs(86_400 * 365));
        assert!(matches!(fail(&registry, "svc").await, Error::CircuitOpen(_)));
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let (registry, clock) = registry_with_clock();
        for _ in 0..10 {
            fail(&registry, "svc").await;
        }
        clock.advance(Duration::from_secs(30));

        // 11 failures out of 11 calls keeps the rate above threshold
        fail(&registry, "svc").await;
        let stats = registry.get_stats("svc").unwrap();
        assert_eq!(stats.state, CircuitState::Open);
        assert_eq!(stats.total_count, 11);
    }

    #[tokio::test]
    async fn test_fallback_used_when_open() {
        let (registry, _) = registry_with_clock();
        for _ in 0..10 {
            fail(&registry, "svc").await;
        }

        let value = registry
            .execute_with_fallback(
                "svc",
                || async { Ok::<_, Error>("live") },
                || async { Ok("cached") },
            )
            .await
            .unwrap();
        assert_eq!(value, "cached");
        assert_eq!(registry.get_stats("svc").unwrap().fallback_count, 1);
    }

    #[tokio::test]
    async fn test_fallback_used_when_call_fails() {
        let (registry, _) = registry_with_clock();
        let value = registry
            .execute_with_fallback(
                "svc",
                || async { Err(Error::NoHealthyInstance("svc".to_string())) },
                || async { Ok("cached") },
            )
            .await
            .unwrap();
        assert_eq!(value, "cached");

        let stats = registry.get_stats("svc").unwrap();
        assert_eq!(stats.failure_count, 1);
        assert_eq!(stats.fallback_count, 0);
    }

    #[tokio::test]
    async fn test_call_timeout_counts_as_failure() {
        let config = CircuitBreakerConfig {
            timeout_ms: 20,
            ..Default::default()
        };
        let registry = CircuitBreakerRegistry::new(config);

        let err = registry
            .execute("slow", || async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok::<_, Error>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BackendFailure(_)));
        assert_eq!(registry.get_stats("slow").unwrap().failure_count, 1);
    }

    #[tokio::test]
    async fn test_reset_circuit_zeroes_counters() {
        let (registry, _) = registry_with_clock();
        for _ in 0..10 {
            fail(&registry, "svc").await;
        }
        registry.reset_circuit("svc");

        let stats = registry.get_stats("svc").unwrap();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failure_count, 0);
        assert_eq!(stats.success_count, 0);
        assert_eq!(stats.total_count, 0);
        assert!(stats.next_attempt_time.is_none());

        registry.reset_circuit("never-used");
        assert_eq!(registry.get_stats("never-used").unwrap().total_count, 0);
    }

    #[tokio::test]
    async fn test_execute_with_retry_succeeds_after_failures() {
        let (registry, _) = registry_with_clock();
        let attempts = &AtomicU32::new(0);

        let value = registry
            .execute_with_retry(
                "svc",
                move || async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Error::BackendFailure("flaky".to_string()))
                    } else {
                        Ok(42)
                    }
                },
                3,
                Duration::from_millis(1),
            )
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_execute_with_retry_returns_last_error() {
        let (registry, _) = registry_with_clock();
        let attempts = &AtomicU32::new(0);

        let err = registry
            .execute_with_retry(
                "svc",
                move || async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(Error::BackendFailure(format!("attempt {n}")))
                },
                3,
                Duration::from_millis(1),
            )
            .await
            .unwrap_err();

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(err.to_string(), "Backend failure: attempt 2");
    }

    #[tokio::test]
    async fn test_graceful_degradation_falls_back_twice() {
        let (registry, _) = registry_with_clock();
        let fallback_calls = &AtomicU32::new(0);

        let result = registry
            .execute_with_graceful_degradation(
                "svc",
                || async { Err::<&str, _>(Error::BackendFailure("down".to_string())) },
                move || async move {
                    if fallback_calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(Error::BackendFailure("cache cold".to_string()))
                    } else {
                        Ok("degraded")
                    }
                },
            )
            .await
            .unwrap();

        assert_eq!(result, "degraded");
        assert_eq!(fallback_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_circuits_are_independent() {
        let (registry, _) = registry_with_clock();
        for _ in 0..10 {
            fail(&registry, "a").await;
        }
        succeed(&registry, "b").await;

        assert_eq!(registry.state("a"), CircuitState::Open);
        assert_eq!(registry.state("b"), CircuitState::Closed);
        let names: Vec<String> = registry.get_all_stats().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_concurrent_failures_are_not_lost() {
        let clock = Arc::new(ManualClock::at_millis(0));
        let config = CircuitBreakerConfig {
            volume_threshold: 1000,
            ..Default::default()
        };
        let registry = Arc::new(CircuitBreakerRegistry::with_clock(config, clock));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    let _ = registry
                        .execute("shared", || async {
                            Err::<(), _>(Error::BackendFailure("x".to_string()))
                        })
                        .await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let stats = registry.get_stats("shared").unwrap();
        assert_eq!(stats.total_count, 500);
        assert_eq!(stats.failure_count, 500);
        assert_eq!(stats.state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_metrics_record_transitions() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let clock = Arc::new(ManualClock::at_millis(0));
        let registry = CircuitBreakerRegistry::with_clock(CircuitBreakerConfig::default(), clock)
            .with_metrics(metrics.clone());

        for _ in 0..10 {
            fail(&registry, "svc").await;
        }
        fail(&registry, "svc").await;

        let rendered = metrics.render().unwrap();
        assert!(rendered.contains("gatewarden_circuit_breaker_state{circuit=\"svc\"} 1"));
        assert!(rendered.contains("gatewarden_circuit_fallbacks_total{circuit=\"svc\"} 1"));
    }
}
