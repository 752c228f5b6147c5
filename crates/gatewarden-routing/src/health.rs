//! Instance health probing
//!
//! Active health checks for load-balanced instances. A probe requests the
//! configured health path and, when that does not answer 2xx, the bare
//! root. Network errors on both requests leave the instance healthy: an
//! unreachable probe target is logged, never treated as proof of failure.

use gatewarden_observability::InstanceHealth;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Advertised health of an instance or registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    #[default]
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

impl From<HealthStatus> for InstanceHealth {
    fn from(status: HealthStatus) -> Self {
        match status {
            HealthStatus::Healthy => InstanceHealth::Healthy,
            HealthStatus::Unhealthy => InstanceHealth::Unhealthy,
            HealthStatus::Unknown => InstanceHealth::Unknown,
        }
    }
}

/// Active health check configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Time between probe cycles, in milliseconds
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Per-request probe timeout, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_path")]
    pub path: String,
}

fn default_enabled() -> bool {
    true
}

fn default_interval_ms() -> u64 {
    30_000
}

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_path() -> String {
    "/health".to_string()
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interval_ms: default_interval_ms(),
            timeout_ms: default_timeout_ms(),
            path: default_path(),
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Result of probing one instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub healthy: bool,
    pub response_time: Duration,
}

/// HTTP health prober
#[derive(Debug, Clone)]
pub struct HealthProbe {
    client: reqwest::Client,
}

impl HealthProbe {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Probe one instance at `base_url`
    pub async fn check(&self, base_url: &str, config: &HealthCheckConfig) -> ProbeResult {
        let started = Instant::now();
        let healthy = self.is_healthy(base_url, config).await;

        ProbeResult {
            healthy,
            response_time: started.elapsed(),
        }
    }

    async fn is_healthy(&self, base_url: &str, config: &HealthCheckConfig) -> bool {
        let base = base_url.trim_end_matches('/');
        let health_url = format!("{}{}", base, config.path);

        let primary_error = match self.get(&health_url, config.timeout()).await {
            Ok(status) if status.is_success() => return true,
            Ok(status) => {
                debug!(url = %health_url, status = %status, "Health path not OK, probing root");
                None
            }
            Err(e) => Some(e),
        };

        let root_url = format!("{}/", base);
        match self.get(&root_url, config.timeout()).await {
            Ok(status) => status.is_success(),
            Err(e) => {
                warn!(
                    url = %base,
                    error = %e,
                    primary_error = ?primary_error,
                    "Health probe failed with network error, keeping instance healthy"
                );
                true
            }
        }
    }

    async fn get(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<reqwest::StatusCode, reqwest::Error> {
        let response = self.client.get(url).timeout(timeout).send().await?;
        Ok(response.status())
    }
}

impl Default for HealthProbe {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_healthy_when_health_path_ok() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let probe = HealthProbe::default();
        let result = probe.check(&server.uri(), &HealthCheckConfig::default()).await;
        assert!(result.healthy);
    }

    #[tokio::test]
    async fn test_falls_back_to_root() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let probe = HealthProbe::default();
        assert!(probe.check(&server.uri(), &HealthCheckConfig::default()).await.healthy);
    }

    #[tokio::test]
    async fn test_unhealthy_when_both_fail_with_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let probe = HealthProbe::default();
        assert!(!probe.check(&server.uri(), &HealthCheckConfig::default()).await.healthy);
    }

    #[tokio::test]
    async fn test_network_error_fails_open() {
        // Nothing listens on port 9 of the loopback interface
        let config = HealthCheckConfig {
            timeout_ms: 500,
            ..Default::default()
        };
        let probe = HealthProbe::default();
        assert!(probe.check("http://127.0.0.1:9", &config).await.healthy);
    }

    #[test]
    fn test_health_status_serde() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Unhealthy).unwrap(),
            "\"unhealthy\""
        );
        assert_eq!(HealthStatus::default(), HealthStatus::Unknown);
    }
}
