//! Gateway configuration
//!
//! One document covers every component. All sections are optional and
//! default to the values documented on each component's config type.

use gatewarden_core::{Error, Result};
use gatewarden_observability::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::warn;

use crate::auth::ApiKeyEntry;
use crate::backend::BackendConfig;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::health::HealthCheckConfig;
use crate::load_balancer::{Algorithm, LoadBalancerConfig, ServiceConfig, ServiceInstance};
use crate::rate_limiter::{RateLimitConfig, RateLimitProfiles};
use crate::registry::RegistryConfig;
use crate::router::RouteDescriptor;

const KNOWN_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

/// Longest accepted duration setting: 365 days
pub const MAX_DURATION_MS: u64 = 365 * 24 * 60 * 60 * 1000;

/// A statically configured instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDefinition {
    pub id: String,
    pub url: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

impl InstanceDefinition {
    pub fn to_instance(&self) -> ServiceInstance {
        ServiceInstance::new(&self.id, &self.url).with_weight(self.weight)
    }
}

/// A statically configured service pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<Algorithm>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckConfig>,

    /// Version advertised in the service registry
    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default)]
    pub instances: Vec<InstanceDefinition>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl ServiceDefinition {
    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            algorithm: self.algorithm,
            health_check: self.health_check.clone(),
        }
    }
}

/// Control-plane directory settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kong_admin_url: Option<String>,
}

/// Complete gateway configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub load_balancer: LoadBalancerConfig,

    #[serde(default)]
    pub rate_limits: RateLimitProfiles,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub routes: Vec<RouteDescriptor>,

    #[serde(default)]
    pub services: Vec<ServiceDefinition>,

    #[serde(default)]
    pub api_keys: Vec<ApiKeyEntry>,

    #[serde(default)]
    pub control_plane: ControlPlaneConfig,
}

impl GatewayConfig {
    /// Load from a file; `.toml` files are TOML, anything else is YAML
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;

        if path.extension().and_then(|s| s.to_str()) == Some("toml") {
            toml::from_str(&contents)
                .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
        } else {
            // Default to YAML
            serde_yaml::from_str(&contents)
                .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
        }
    }

    /// Merge environment variables into config (env vars take precedence)
    pub fn merge_env(&mut self) {
        if let Ok(val) = std::env::var("GATEWARDEN_LOG_LEVEL") {
            self.logging.level = val;
        }

        if let Ok(val) = std::env::var("GATEWARDEN_LOG_FORMAT") {
            match val.parse() {
                Ok(format) => self.logging.format = format,
                Err(_) => warn!(value = %val, "Invalid GATEWARDEN_LOG_FORMAT, keeping configured format"),
            }
        }

        if let Ok(val) = std::env::var("GATEWARDEN_KONG_ADMIN_URL") {
            self.control_plane.kong_admin_url = Some(val);
        }

        if let Ok(val) = std::env::var("GATEWARDEN_HEALTH_CHECKS") {
            match val.parse::<bool>() {
                Ok(enabled) => self.load_balancer.health_check.enabled = enabled,
                Err(_) => warn!(value = %val, "Invalid GATEWARDEN_HEALTH_CHECKS, expected true or false"),
            }
        }
    }

    /// Reject values the components cannot operate with
    pub fn validate(&self) -> Result<()> {
        let cb = &self.circuit_breaker;
        if !(0.0..=100.0).contains(&cb.error_threshold_percentage) {
            return Err(Error::Config(format!(
                "circuit_breaker.error_threshold_percentage must be within 0..=100, got {}",
                cb.error_threshold_percentage
            )));
        }
        if cb.volume_threshold == 0 {
            return Err(Error::Config(
                "circuit_breaker.volume_threshold must be at least 1".to_string(),
            ));
        }
        validate_duration("circuit_breaker.timeout_ms", cb.timeout_ms)?;
        validate_duration("circuit_breaker.reset_timeout_ms", cb.reset_timeout_ms)?;

        let registry = &self.registry;
        for (name, ms) in [
            ("heartbeat_interval_ms", registry.heartbeat_interval_ms),
            ("heartbeat_timeout_ms", registry.heartbeat_timeout_ms),
            ("cleanup_interval_ms", registry.cleanup_interval_ms),
            ("max_age_ms", registry.max_age_ms),
        ] {
            validate_duration(&format!("registry.{}", name), ms)?;
        }

        validate_duration("backend.timeout_ms", self.backend.timeout_ms)?;
        validate_duration("backend.connect_timeout_ms", self.backend.connect_timeout_ms)?;
        validate_health_check("load_balancer.health_check", &self.load_balancer.health_check)?;

        let limits = &self.rate_limits;
        for (name, limit) in [
            ("api_key", &limits.api_key),
            ("hourly", &limits.hourly),
            ("user", &limits.user),
            ("ip", &limits.ip),
            ("route_default", &limits.route_default),
        ] {
            validate_limit(&format!("rate_limits.{}", name), limit)?;
        }

        for service in &self.services {
            if let Some(health_check) = &service.health_check {
                validate_health_check(&format!("service '{}' health_check", service.name), health_check)?;
            }
            let mut seen = HashSet::new();
            for instance in &service.instances {
                if instance.weight == 0 {
                    return Err(Error::Config(format!(
                        "service '{}': instance '{}' has weight 0",
                        service.name, instance.id
                    )));
                }
                if !seen.insert(instance.id.as_str()) {
                    return Err(Error::Config(format!(
                        "service '{}': duplicate instance id '{}'",
                        service.name, instance.id
                    )));
                }
            }
        }

        if let Some(entry) = self
            .api_keys
            .iter()
            .find(|entry| entry.per_minute == Some(0) || entry.per_hour == Some(0))
        {
            return Err(Error::Config(format!(
                "api key '{}': rate limit quotas must be at least 1",
                entry.key_id
            )));
        }

        for route in &self.routes {
            if !route.path.starts_with('/') {
                return Err(Error::Config(format!(
                    "route '{}' must start with '/'",
                    route.path
                )));
            }
            if let Some(method) = route
                .methods
                .iter()
                .find(|m| !KNOWN_METHODS.contains(&m.to_ascii_uppercase().as_str()))
            {
                return Err(Error::Config(format!(
                    "route '{}': unknown method '{}'",
                    route.path, method
                )));
            }
            if let Some(limit) = &route.rate_limit
                && (limit.per_minute == 0 || limit.per_hour == Some(0))
            {
                return Err(Error::Config(format!(
                    "route '{}': rate limit quotas must be at least 1",
                    route.path
                )));
            }
        }

        Ok(())
    }
}

fn validate_limit(name: &str, limit: &RateLimitConfig) -> Result<()> {
    if limit.window_ms == 0 || limit.max_requests == 0 {
        return Err(Error::Config(format!(
            "{} needs a non-zero window and quota",
            name
        )));
    }
    validate_duration(&format!("{}.window_ms", name), limit.window_ms)
}

fn validate_health_check(name: &str, health_check: &HealthCheckConfig) -> Result<()> {
    validate_duration(&format!("{}.interval_ms", name), health_check.interval_ms)?;
    validate_duration(&format!("{}.timeout_ms", name), health_check.timeout_ms)
}

fn validate_duration(name: &str, ms: u64) -> Result<()> {
    if ms > MAX_DURATION_MS {
        return Err(Error::Config(format!(
            "{} must be at most {} ms, got {}",
            name, MAX_DURATION_MS, ms
        )));
    }
    Ok(())
}
