//! Load balancing across service instances
//!
//! Keeps one instance pool per service and selects an instance per call
//! with one of four algorithms:
//! - round-robin: per-service cursor, advanced modulo the pool size
//! - least-connections: fewest active connections, first in list order on ties
//! - weighted: random draw in `[0, total_weight)`, walked down the list
//! - ip-hash: polynomial hash (multiplier 31, 32-bit wrapping) of the client IP;
//!   round-robin when no IP is known
//!
//! Instances are marked healthy on registration. When health checks are
//! enabled each service gets a background probe task, replaced when the
//! service is registered again and stopped when it is deregistered.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use gatewarden_core::clock::{SharedClock, system_clock};
use gatewarden_core::{Error, Result};
use gatewarden_observability::Metrics;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::health::{HealthCheckConfig, HealthProbe, HealthStatus};

/// Instance selection algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
    #[default]
    RoundRobin,
    LeastConnections,
    Weighted,
    IpHash,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round-robin",
            Self::LeastConnections => "least-connections",
            Self::Weighted => "weighted",
            Self::IpHash => "ip-hash",
        }
    }
}

impl FromStr for Algorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "round-robin" | "round_robin" => Ok(Self::RoundRobin),
            "least-connections" | "least_connections" => Ok(Self::LeastConnections),
            "weighted" => Ok(Self::Weighted),
            "ip-hash" | "ip_hash" => Ok(Self::IpHash),
            other => Err(Error::Config(format!(
                "Unknown load balancing algorithm '{}'",
                other
            ))),
        }
    }
}

fn default_weight() -> u32 {
    1
}

/// One addressable copy of a backend service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: String,
    pub url: String,

    #[serde(default)]
    pub health: HealthStatus,

    #[serde(default = "default_weight")]
    pub weight: u32,

    #[serde(default)]
    pub last_check: Option<DateTime<Utc>>,

    /// Duration of the last health probe, in milliseconds
    #[serde(default)]
    pub response_time_ms: Option<u64>,

    #[serde(default)]
    pub active_connections: u64,
}

impl ServiceInstance {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            health: HealthStatus::Unknown,
            weight: default_weight(),
            last_check: None,
            response_time_ms: None,
            active_connections: 0,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }
}

/// Per-service overrides supplied at registration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub algorithm: Option<Algorithm>,

    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,
}

/// Load balancer configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerConfig {
    /// Algorithm for services registered without one
    #[serde(default)]
    pub default_algorithm: Algorithm,

    /// Skip instances marked unhealthy when selecting
    #[serde(default)]
    pub filter_unhealthy: bool,

    #[serde(default)]
    pub health_check: HealthCheckConfig,
}

/// Snapshot of one service pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStats {
    pub service: String,
    pub algorithm: Algorithm,
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub unhealthy_instances: usize,
    pub total_active_connections: u64,
    pub instances: Vec<ServiceInstance>,
}

#[derive(Debug)]
struct ServicePool {
    instances: Vec<ServiceInstance>,
    algorithm: Algorithm,
    health_check: HealthCheckConfig,
    cursor: usize,
}

impl ServicePool {
    fn stats(&self, service: &str) -> ServiceStats {
        let count = |status: HealthStatus| {
            self.instances
                .iter()
                .filter(|instance| instance.health == status)
                .count()
        };

        ServiceStats {
            service: service.to_string(),
            algorithm: self.algorithm,
            total_instances: self.instances.len(),
            healthy_instances: count(HealthStatus::Healthy),
            unhealthy_instances: count(HealthStatus::Unhealthy),
            total_active_connections: self
                .instances
                .iter()
                .map(|instance| instance.active_connections)
                .sum(),
            instances: self.instances.clone(),
        }
    }
}

/// 32-bit polynomial string hash (multiplier 31, wrapping)
pub fn ip_hash(ip: &str) -> i32 {
    ip.encode_utf16()
        .fold(0i32, |hash, unit| hash.wrapping_mul(31).wrapping_add(unit as i32))
}

/// Index chosen by ip-hash for a pool of `len` instances
pub fn ip_hash_index(ip: &str, len: usize) -> usize {
    ip_hash(ip).unsigned_abs() as usize % len
}

/// Weighted pick for a draw in `[0, total_weight)`
///
/// Walks the weights subtracting each from the draw until the remainder is
/// at or below zero. Falls back to the last index when the weights do not
/// cover the draw. `None` for an empty slice.
pub fn select_weighted(weights: &[u32], draw: f64) -> Option<usize> {
    if weights.is_empty() {
        return None;
    }

    let mut remainder = draw;
    for (index, weight) in weights.iter().enumerate() {
        remainder -= f64::from(*weight);
        if remainder <= 0.0 {
            return Some(index);
        }
    }

    Some(weights.len() - 1)
}

/// First index with the fewest active connections
pub fn select_least_connections(connections: &[u64]) -> Option<usize> {
    let mut best: Option<(usize, u64)> = None;
    for (index, count) in connections.iter().enumerate() {
        match best {
            Some((_, lowest)) if *count >= lowest => {}
            _ => best = Some((index, *count)),
        }
    }
    best.map(|(index, _)| index)
}

/// Probe state shared with the background health tasks
#[derive(Clone)]
struct HealthCycle {
    pools: Arc<DashMap<String, ServicePool>>,
    probe: HealthProbe,
    clock: SharedClock,
    metrics: Option<Arc<Metrics>>,
}

impl HealthCycle {
    /// Probe every instance of `service` concurrently and record the results.
    /// Returns false once the service is gone.
    async fn run(&self, service: &str) -> bool {
        let (targets, config) = match self.pools.get(service) {
            Some(pool) => (
                pool.instances
                    .iter()
                    .map(|instance| (instance.id.clone(), instance.url.clone()))
                    .collect::<Vec<_>>(),
                pool.health_check.clone(),
            ),
            None => return false,
        };

        let checks = targets.into_iter().map(|(id, url)| {
            let probe = &self.probe;
            let config = &config;
            async move {
                let result = probe.check(&url, config).await;
                (id, result)
            }
        });
        let results = join_all(checks).await;

        let now = self.clock.now();
        let Some(mut pool) = self.pools.get_mut(service) else {
            return false;
        };

        for (id, result) in results {
            let Some(instance) = pool.instances.iter_mut().find(|i| i.id == id) else {
                continue;
            };

            let health = if result.healthy {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy
            };
            if instance.health != health {
                match health {
                    HealthStatus::Unhealthy => {
                        warn!(service = %service, instance = %id, "Instance failed health check")
                    }
                    _ => info!(service = %service, instance = %id, "Instance healthy again"),
                }
            }

            instance.health = health;
            instance.last_check = Some(now);
            instance.response_time_ms = Some(result.response_time.as_millis() as u64);

            if let Some(metrics) = &self.metrics {
                metrics.update_instance_health(service, &id, health.into());
            }
        }

        true
    }
}

/// Load balancer over per-service instance pools
pub struct LoadBalancer {
    pools: Arc<DashMap<String, ServicePool>>,
    health_tasks: DashMap<String, JoinHandle<()>>,
    config: LoadBalancerConfig,
    cycle: HealthCycle,
}

impl LoadBalancer {
    pub fn new(config: LoadBalancerConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: LoadBalancerConfig, clock: SharedClock) -> Self {
        Self::with_probe(config, HealthProbe::default(), clock)
    }

    pub fn with_probe(config: LoadBalancerConfig, probe: HealthProbe, clock: SharedClock) -> Self {
        let pools = Arc::new(DashMap::new());
        Self {
            pools: pools.clone(),
            health_tasks: DashMap::new(),
            config,
            cycle: HealthCycle {
                pools,
                probe,
                clock,
                metrics: None,
            },
        }
    }

    /// Attach a metrics collector
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.cycle.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &LoadBalancerConfig {
        &self.config
    }

    fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.cycle.metrics.as_ref()
    }

    /// Register (or replace) the instance pool for a service
    ///
    /// Every instance starts healthy, and weights below 1 are raised to 1.
    /// With health checks enabled a probe
    /// task is started, replacing any previous task for the service; this
    /// needs a running tokio runtime and is skipped with a warning otherwise.
    pub fn register_service(
        &self,
        name: &str,
        instances: Vec<ServiceInstance>,
        config: Option<ServiceConfig>,
    ) {
        let config = config.unwrap_or_default();
        let algorithm = config.algorithm.unwrap_or(self.config.default_algorithm);
        let health_check = config
            .health_check
            .unwrap_or_else(|| self.config.health_check.clone());

        let now = self.cycle.clock.now();
        let instances: Vec<ServiceInstance> = instances
            .into_iter()
            .map(|mut instance| {
                instance.weight = instance.weight.max(1);
                instance.health = HealthStatus::Healthy;
                instance.last_check = Some(now);
                instance.active_connections = 0;
                instance
            })
            .collect();

        if let Some(metrics) = self.metrics() {
            for instance in &instances {
                metrics.update_instance_health(name, &instance.id, HealthStatus::Healthy.into());
            }
        }

        info!(
            service = %name,
            instances = instances.len(),
            algorithm = algorithm.as_str(),
            "Registered service with load balancer"
        );

        let enabled = health_check.enabled;
        let interval = health_check.interval();
        self.pools.insert(
            name.to_string(),
            ServicePool {
                instances,
                algorithm,
                health_check,
                cursor: 0,
            },
        );

        if enabled {
            self.spawn_health_task(name, interval);
        } else if let Some((_, previous)) = self.health_tasks.remove(name) {
            previous.abort();
        }
    }

    fn spawn_health_task(&self, service: &str, interval: Duration) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(service = %service, "No tokio runtime, health checks not started");
            return;
        };

        let period = interval.max(Duration::from_millis(1));
        let cycle = self.cycle.clone();
        let name = service.to_string();

        let task = runtime.spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if !cycle.run(&name).await {
                    debug!(service = %name, "Service gone, stopping health checks");
                    break;
                }
            }
        });

        if let Some(previous) = self.health_tasks.insert(service.to_string(), task) {
            previous.abort();
        }
    }

    /// Remove a service and stop its health checks
    pub fn deregister_service(&self, name: &str) -> bool {
        if let Some((_, task)) = self.health_tasks.remove(name) {
            task.abort();
        }
        let removed = self.pools.remove(name).is_some();
        if removed {
            info!(service = %name, "Deregistered service from load balancer");
        }
        removed
    }

    /// Add an instance to a registered service, replacing one with the same id
    ///
    /// A weight of 0 is raised to 1.
    pub fn add_instance(&self, service: &str, mut instance: ServiceInstance) -> Result<()> {
        let mut pool = self
            .pools
            .get_mut(service)
            .ok_or_else(|| Error::ServiceNotFound(service.to_string()))?;

        instance.weight = instance.weight.max(1);
        instance.health = HealthStatus::Healthy;
        instance.last_check = Some(self.cycle.clock.now());
        instance.active_connections = 0;

        match pool.instances.iter_mut().find(|i| i.id == instance.id) {
            Some(existing) => *existing = instance,
            None => pool.instances.push(instance),
        }
        Ok(())
    }

    pub fn remove_instance(&self, service: &str, instance_id: &str) -> bool {
        let Some(mut pool) = self.pools.get_mut(service) else {
            return false;
        };
        let before = pool.instances.len();
        pool.instances.retain(|instance| instance.id != instance_id);
        let len = pool.instances.len();
        if len > 0 {
            pool.cursor %= len;
        } else {
            pool.cursor = 0;
        }
        len < before
    }

    /// Select the next instance for a service
    ///
    /// `algorithm` overrides the service's configured algorithm. Returns
    /// `None` when the service is unknown or has no candidate instances.
    pub fn get_next_instance(
        &self,
        service: &str,
        algorithm: Option<Algorithm>,
        client_ip: Option<&str>,
    ) -> Option<ServiceInstance> {
        let mut guard = self.pools.get_mut(service)?;
        let pool = &mut *guard;

        let candidates: Vec<usize> = pool
            .instances
            .iter()
            .enumerate()
            .filter(|(_, instance)| {
                !self.config.filter_unhealthy || instance.health != HealthStatus::Unhealthy
            })
            .map(|(index, _)| index)
            .collect();

        if candidates.is_empty() {
            debug!(service = %service, "No instances available");
            return None;
        }

        let algorithm = algorithm.unwrap_or(pool.algorithm);
        let len = candidates.len();
        let round_robin = |cursor: &mut usize| {
            let index = *cursor % len;
            *cursor = (index + 1) % len;
            index
        };

        let choice = match algorithm {
            Algorithm::RoundRobin => Some(round_robin(&mut pool.cursor)),
            Algorithm::LeastConnections => {
                let connections: Vec<u64> = candidates
                    .iter()
                    .map(|&i| pool.instances[i].active_connections)
                    .collect();
                select_least_connections(&connections)
            }
            Algorithm::Weighted => {
                let weights: Vec<u32> = candidates
                    .iter()
                    .map(|&i| pool.instances[i].weight)
                    .collect();
                let total: u64 = weights.iter().map(|w| u64::from(*w)).sum();
                if total == 0 {
                    None
                } else {
                    select_weighted(&weights, rand::random::<f64>() * total as f64)
                }
            }
            Algorithm::IpHash => match client_ip {
                Some(ip) => Some(ip_hash_index(ip, len)),
                None => Some(round_robin(&mut pool.cursor)),
            },
        };

        let position = choice.unwrap_or_else(|| {
            warn!(
                service = %service,
                algorithm = algorithm.as_str(),
                "Selection failed, using first instance"
            );
            0
        });

        Some(pool.instances[candidates[position]].clone())
    }

    /// Probe one instance with the default health check settings
    pub async fn check_instance_health(&self, instance: &ServiceInstance) -> bool {
        self.cycle
            .probe
            .check(&instance.url, &self.config.health_check)
            .await
            .healthy
    }

    /// Run one probe cycle for a service. Returns false if it is not registered.
    pub async fn run_health_check_cycle(&self, service: &str) -> bool {
        self.cycle.run(service).await
    }

    /// Set an instance's health. Returns false if it is unknown.
    pub fn update_instance_health(
        &self,
        service: &str,
        instance_id: &str,
        health: HealthStatus,
    ) -> bool {
        let now = self.cycle.clock.now();
        let updated = self
            .pools
            .get_mut(service)
            .and_then(|mut pool| {
                pool.instances
                    .iter_mut()
                    .find(|instance| instance.id == instance_id)
                    .map(|instance| {
                        instance.health = health;
                        instance.last_check = Some(now);
                    })
            })
            .is_some();

        if updated && let Some(metrics) = self.metrics() {
            metrics.update_instance_health(service, instance_id, health.into());
        }
        updated
    }

    fn adjust_connections(&self, service: &str, instance_id: &str, delta: i64) -> Option<u64> {
        let mut pool = self.pools.get_mut(service)?;
        let instance = pool
            .instances
            .iter_mut()
            .find(|instance| instance.id == instance_id)?;

        instance.active_connections = if delta >= 0 {
            instance.active_connections.saturating_add(delta as u64)
        } else {
            instance
                .active_connections
                .saturating_sub(delta.unsigned_abs())
        };
        let count = instance.active_connections;

        if let Some(metrics) = self.metrics() {
            metrics.set_active_connections(service, instance_id, count);
        }
        Some(count)
    }

    /// Count a call starting on an instance
    pub fn increment_connections(&self, service: &str, instance_id: &str) -> Option<u64> {
        self.adjust_connections(service, instance_id, 1)
    }

    /// Count a call finishing on an instance; never drops below zero
    pub fn decrement_connections(&self, service: &str, instance_id: &str) -> Option<u64> {
        self.adjust_connections(service, instance_id, -1)
    }

    pub fn get_service_stats(&self, service: &str) -> Option<ServiceStats> {
        self.pools.get(service).map(|pool| pool.stats(service))
    }

    /// Stats for every registered service, sorted by name
    pub fn get_all_stats(&self) -> Vec<ServiceStats> {
        let mut stats: Vec<ServiceStats> = self
            .pools
            .iter()
            .map(|entry| entry.value().stats(entry.key()))
            .collect();
        stats.sort_by(|a, b| a.service.cmp(&b.service));
        stats
    }

    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn algorithm_for(&self, service: &str) -> Option<Algorithm> {
        self.pools.get(service).map(|pool| pool.algorithm)
    }

    /// Whether a background health task is running for a service
    pub fn has_health_task(&self, service: &str) -> bool {
        self.health_tasks
            .get(service)
            .is_some_and(|task| !task.is_finished())
    }

    /// Stop every health check task
    pub fn shutdown(&self) {
        for entry in self.health_tasks.iter() {
            entry.value().abort();
        }
        self.health_tasks.clear();
        debug!("Load balancer health checks stopped");
    }
}

impl Drop for LoadBalancer {
    fn drop(&mut self) {
        for entry in self.health_tasks.iter() {
            entry.value().abort();
        }
    }
}
