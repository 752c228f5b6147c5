//! Service registry with heartbeat liveness
//!
//! Two independent timers keep the registry honest:
//! - a heartbeat watchdog per registration flips it to unhealthy once
//!   `heartbeat_timeout` passes without a heartbeat (it is not removed)
//! - a global stale sweep removes any registration whose last heartbeat is
//!   older than `max_age`, whatever its health flag says

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use gatewarden_core::clock::{SharedClock, system_clock, to_chrono};
use gatewarden_core::{Error, Result};
use gatewarden_observability::Metrics;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::health::HealthStatus;

/// A registered service instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRegistration {
    pub id: String,
    pub name: String,
    pub url: String,
    pub version: String,

    #[serde(default)]
    pub health: HealthStatus,

    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,

    pub last_heartbeat: DateTime<Utc>,

    /// Assigned by the registry on registration
    pub registered_at: DateTime<Utc>,
}

impl ServiceRegistration {
    /// A healthy registration whose last heartbeat is now
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        url: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            url: url.into(),
            version: version.into(),
            health: HealthStatus::Healthy,
            metadata: HashMap::new(),
            last_heartbeat: now,
            registered_at: now,
        }
    }

    pub fn with_last_heartbeat(mut self, at: DateTime<Utc>) -> Self {
        self.last_heartbeat = at;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Registry timers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Silence after which a registration is flagged unhealthy
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,

    /// Silence after which a registration is removed
    #[serde(default = "default_max_age_ms")]
    pub max_age_ms: u64,
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    90_000
}

fn default_cleanup_interval_ms() -> u64 {
    300_000
}

fn default_max_age_ms() -> u64 {
    300_000
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
            max_age_ms: default_max_age_ms(),
        }
    }
}

impl RegistryConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_millis(self.max_age_ms)
    }
}

/// Registry counts by health and by name
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub unknown: usize,
    pub by_name: BTreeMap<String, usize>,
}

/// State shared with the heartbeat watchdogs and the stale sweep
struct RegistryState {
    services: DashMap<String, ServiceRegistration>,
    heartbeat_tasks: DashMap<String, JoinHandle<()>>,
    config: RegistryConfig,
    clock: SharedClock,
    metrics: Option<Arc<Metrics>>,
}

impl RegistryState {
    fn check_heartbeat(&self, id: &str) -> Option<HealthStatus> {
        let now = self.clock.now();
        let timeout = to_chrono(self.config.heartbeat_timeout());
        let mut registration = self.services.get_mut(id)?;

        if now - registration.last_heartbeat > timeout
            && registration.health != HealthStatus::Unhealthy
        {
            warn!(
                service = %registration.name,
                instance = %id,
                last_heartbeat = %registration.last_heartbeat,
                "Heartbeat timeout, marking service unhealthy"
            );
            registration.health = HealthStatus::Unhealthy;
        }

        Some(registration.health)
    }

    fn sweep(&self) -> Vec<String> {
        let now = self.clock.now();
        let max_age = to_chrono(self.config.max_age());
        let is_stale = |registration: &ServiceRegistration| now - registration.last_heartbeat > max_age;

        let candidates: Vec<String> = self
            .services
            .iter()
            .filter(|entry| is_stale(entry.value()))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = Vec::new();
        for id in candidates {
            // A heartbeat or re-registration since the scan keeps the entry
            let Some((_, registration)) = self.services.remove_if(&id, |_, r| is_stale(r)) else {
                continue;
            };
            info!(
                service = %registration.name,
                instance = %id,
                "Removed stale service registration"
            );
            if let Some((_, task)) = self
                .heartbeat_tasks
                .remove_if(&id, |key, _| !self.services.contains_key(key))
            {
                task.abort();
            }
            if let Some(metrics) = &self.metrics {
                metrics.record_registry_eviction("stale");
            }
            removed.push(id);
        }

        if !removed.is_empty() {
            self.publish_size();
        }
        removed
    }

    fn publish_size(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.set_registered_services(self.services.len());
        }
    }
}

/// Handle to the background stale sweep
pub struct SweepTask {
    shutdown_tx: tokio::sync::mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl SweepTask {
    /// Signal the sweep task to shutdown gracefully and wait for it
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.handle.await;
    }

    fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    fn abort(&self) {
        self.handle.abort();
    }
}

/// In-memory service registry
pub struct ServiceRegistry {
    state: Arc<RegistryState>,
    sweep: Mutex<Option<SweepTask>>,
}

impl ServiceRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: RegistryConfig, clock: SharedClock) -> Self {
        Self {
            state: Arc::new(RegistryState {
                services: DashMap::new(),
                heartbeat_tasks: DashMap::new(),
                config,
                clock,
                metrics: None,
            }),
            sweep: Mutex::new(None),
        }
    }

    fn sweep_slot(&self) -> MutexGuard<'_, Option<SweepTask>> {
        self.sweep.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attach a metrics collector; call before registering services
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        if let Some(state) = Arc::get_mut(&mut self.state) {
            state.metrics = Some(metrics);
        } else {
            warn!("Registry already shared, metrics not attached");
        }
        self
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.state.config
    }

    pub fn clock(&self) -> &SharedClock {
        &self.state.clock
    }

    /// Register (or replace) a service instance
    ///
    /// `registered_at` is assigned here; every other field is stored as given.
    /// A heartbeat watchdog is started when a tokio runtime is available.
    pub fn register_service(&self, mut registration: ServiceRegistration) -> ServiceRegistration {
        registration.registered_at = self.state.clock.now();
        let id = registration.id.clone();

        info!(
            service = %registration.name,
            instance = %id,
            url = %registration.url,
            version = %registration.version,
            "Registered service"
        );

        self.state.services.insert(id.clone(), registration.clone());
        self.state.publish_size();
        self.spawn_heartbeat_watchdog(&id);

        registration
    }

    fn spawn_heartbeat_watchdog(&self, id: &str) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(instance = %id, "No tokio runtime, heartbeat watchdog not started");
            return;
        };

        let period = self
            .state
            .config
            .heartbeat_interval()
            .max(Duration::from_millis(1));
        let state = Arc::downgrade(&self.state);
        let instance = id.to_string();

        let task = runtime.spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(state) = state.upgrade() else {
                    break;
                };
                if state.check_heartbeat(&instance).is_none() {
                    debug!(instance = %instance, "Registration gone, stopping heartbeat watchdog");
                    break;
                }
            }
        });

        if let Some(previous) = self.state.heartbeat_tasks.insert(id.to_string(), task) {
            previous.abort();
        }
    }

    /// Remove a registration and stop its watchdog
    pub fn deregister_service(&self, id: &str) -> Option<ServiceRegistration> {
        if let Some((_, task)) = self.state.heartbeat_tasks.remove(id) {
            task.abort();
        }

        let removed = self.state.services.remove(id).map(|(_, registration)| registration);
        if let Some(registration) = &removed {
            info!(service = %registration.name, instance = %id, "Deregistered service");
            if let Some(metrics) = &self.state.metrics {
                metrics.record_registry_eviction("deregistered");
            }
            self.state.publish_size();
        }
        removed
    }

    pub fn get_service(&self, id: &str) -> Option<ServiceRegistration> {
        self.state.services.get(id).map(|entry| entry.value().clone())
    }

    /// Healthy registrations for a service name, ordered by id
    pub fn get_services_by_name(&self, name: &str) -> Vec<ServiceRegistration> {
        let mut services: Vec<ServiceRegistration> = self
            .state
            .services
            .iter()
            .filter(|entry| entry.name == name && entry.health.is_healthy())
            .map(|entry| entry.value().clone())
            .collect();
        services.sort_by(|a, b| a.id.cmp(&b.id));
        services
    }

    /// Every registration, ordered by id
    pub fn list_services(&self) -> Vec<ServiceRegistration> {
        let mut services: Vec<ServiceRegistration> = self
            .state
            .services
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        services.sort_by(|a, b| a.id.cmp(&b.id));
        services
    }

    /// Record a heartbeat; the registration becomes healthy again
    pub fn heartbeat(&self, id: &str) -> Result<()> {
        let now = self.state.clock.now();
        let mut registration = self
            .state
            .services
            .get_mut(id)
            .ok_or_else(|| Error::ServiceNotFound(id.to_string()))?;

        registration.last_heartbeat = now;
        if registration.health != HealthStatus::Healthy {
            info!(service = %registration.name, instance = %id, "Heartbeat resumed");
            registration.health = HealthStatus::Healthy;
        }
        Ok(())
    }

    pub fn update_service_health(&self, id: &str, health: HealthStatus) -> Result<()> {
        let mut registration = self
            .state
            .services
            .get_mut(id)
            .ok_or_else(|| Error::ServiceNotFound(id.to_string()))?;

        if registration.health != health {
            debug!(
                instance = %id,
                from = registration.health.as_str(),
                to = health.as_str(),
                "Service health updated"
            );
        }
        registration.health = health;
        Ok(())
    }

    /// Merge metadata into a registration
    pub fn update_service_metadata(
        &self,
        id: &str,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<()> {
        let mut registration = self
            .state
            .services
            .get_mut(id)
            .ok_or_else(|| Error::ServiceNotFound(id.to_string()))?;
        registration.metadata.extend(metadata);
        Ok(())
    }

    /// Run the heartbeat check for one registration
    ///
    /// Returns its health afterwards, or `None` if it is not registered.
    pub fn check_heartbeat(&self, id: &str) -> Option<HealthStatus> {
        self.state.check_heartbeat(id)
    }

    /// Run the heartbeat check for every registration; returns how many are unhealthy
    pub fn check_all_heartbeats(&self) -> usize {
        let ids: Vec<String> = self
            .state
            .services
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        ids.iter()
            .filter_map(|id| self.state.check_heartbeat(id))
            .filter(|health| *health == HealthStatus::Unhealthy)
            .count()
    }

    /// Remove registrations silent for longer than `max_age`; returns their ids
    pub fn sweep_stale_services(&self) -> Vec<String> {
        self.state.sweep()
    }

    /// Start the periodic stale sweep
    ///
    /// Returns whether a sweep is running afterwards. Without a tokio runtime
    /// nothing is started.
    pub fn spawn_stale_sweep(&self) -> bool {
        let mut slot = self.sweep_slot();
        if slot.as_ref().is_some_and(SweepTask::is_running) {
            return true;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No tokio runtime, stale service sweep not started");
            return false;
        };

        let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
        let state = self.state.clone();
        let interval = state.config.cleanup_interval().max(Duration::from_millis(1));

        let handle = runtime.spawn(async move {
            info!(interval_ms = interval.as_millis() as u64, "Starting stale service sweep");

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Stale service sweep shutting down");
                        break;
                    }
                    _ = sleep(interval) => {
                        let removed = state.sweep();
                        if !removed.is_empty() {
                            info!(removed = removed.len(), "Stale sweep cycle");
                        }
                    }
                }
            }
        });

        *slot = Some(SweepTask {
            shutdown_tx,
            handle,
        });
        true
    }

    /// Stop the stale sweep and wait for it to finish
    pub async fn stop_stale_sweep(&self) {
        let task = self.sweep_slot().take();
        if let Some(task) = task {
            task.shutdown().await;
        }
    }

    pub fn has_stale_sweep(&self) -> bool {
        self.sweep_slot().as_ref().is_some_and(SweepTask::is_running)
    }

    pub fn get_registry_stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            total: 0,
            healthy: 0,
            unhealthy: 0,
            unknown: 0,
            by_name: BTreeMap::new(),
        };

        for entry in self.state.services.iter() {
            stats.total += 1;
            match entry.health {
                HealthStatus::Healthy => stats.healthy += 1,
                HealthStatus::Unhealthy => stats.unhealthy += 1,
                HealthStatus::Unknown => stats.unknown += 1,
            }
            *stats.by_name.entry(entry.name.clone()).or_insert(0) += 1;
        }

        stats
    }

    /// Whether a heartbeat watchdog is running for a registration
    pub fn has_heartbeat_watchdog(&self, id: &str) -> bool {
        self.state
            .heartbeat_tasks
            .get(id)
            .is_some_and(|task| !task.is_finished())
    }

    /// Stop the stale sweep and every heartbeat watchdog
    pub fn shutdown(&self) {
        if let Some(task) = self.sweep_slot().take() {
            task.abort();
        }
        for entry in self.state.heartbeat_tasks.iter() {
            entry.value().abort();
        }
        self.state.heartbeat_tasks.clear();
    }
}

impl Drop for ServiceRegistry {
    fn drop(&mut self) {
        if let Some(task) = self.sweep_slot().take() {
            task.abort();
        }
        for entry in self.state.heartbeat_tasks.iter() {
            entry.value().abort();
        }
    }
}
