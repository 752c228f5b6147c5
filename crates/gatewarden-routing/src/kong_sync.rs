//! One-way pull from a Kong admin API into the service registry
//!
//! Each entry of `GET {admin}/services` becomes a registration tagged with
//! its provenance. A bad entry is recorded in the summary and the sync
//! carries on with the rest.

use chrono::{DateTime, Utc};
use gatewarden_core::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::registry::{ServiceRegistration, ServiceRegistry};

const DEFAULT_VERSION: &str = "1.0.0";

/// A service as described by the Kong admin API
#[derive(Debug, Clone, Deserialize)]
pub struct KongService {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct KongServiceList {
    #[serde(default)]
    data: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Synced,
    Error,
}

/// Outcome for one remote entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncDetail {
    pub service: String,
    pub status: SyncStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub synced: usize,
    pub errors: usize,
    pub details: Vec<SyncDetail>,
}

impl SyncSummary {
    fn record_ok(&mut self, service: String) {
        self.synced += 1;
        self.details.push(SyncDetail {
            service,
            status: SyncStatus::Synced,
            error: None,
        });
    }

    fn record_error(&mut self, service: String, error: String) {
        self.errors += 1;
        self.details.push(SyncDetail {
            service,
            status: SyncStatus::Error,
            error: Some(error),
        });
    }
}

impl KongService {
    /// Upstream URL, `protocol://host:port{path}`
    pub fn upstream_url(&self) -> Result<String> {
        let host = self
            .host
            .as_deref()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::ControlPlane(format!("service {} has no host", self.id)))?;
        let protocol = self.protocol.as_deref().unwrap_or("http");
        let port = self
            .port
            .unwrap_or(if protocol == "https" { 443 } else { 80 });
        let path = self.path.as_deref().unwrap_or("");

        Ok(format!("{}://{}:{}{}", protocol, host, port, path))
    }

    fn version(&self) -> String {
        self.tags
            .iter()
            .flatten()
            .find_map(|tag| tag.strip_prefix("version:"))
            .unwrap_or(DEFAULT_VERSION)
            .to_string()
    }

    fn into_registration(self, now: DateTime<Utc>) -> Result<ServiceRegistration> {
        let url = self.upstream_url()?;
        let version = self.version();
        let name = self.name.clone().unwrap_or_else(|| self.id.clone());

        Ok(
            ServiceRegistration::new(format!("kong-{}", self.id), name, url, version)
                .with_metadata("source", json!("kong"))
                .with_metadata("kong_id", json!(self.id))
                .with_last_heartbeat(now)
                .with_metadata("synced_at", json!(now.to_rfc3339())),
        )
    }
}

/// Client for the Kong admin API
pub struct KongSync {
    client: reqwest::Client,
    admin_url: String,
}

impl KongSync {
    pub fn new(admin_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| Error::ControlPlane(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self::with_client(client, admin_url))
    }

    pub fn with_client(client: reqwest::Client, admin_url: impl Into<String>) -> Self {
        Self {
            client,
            admin_url: admin_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Fetch the raw service list
    pub async fn fetch_services(&self) -> Result<Vec<serde_json::Value>> {
        let url = format!("{}/services", self.admin_url);
        debug!(url = %url, "Fetching Kong services");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::ControlPlane(format!("GET {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::ControlPlane(format!(
                "GET {} returned {}",
                url, status
            )));
        }

        let list: KongServiceList = response
            .json()
            .await
            .map_err(|e| Error::ControlPlane(format!("Invalid service list: {}", e)))?;
        Ok(list.data)
    }

    /// Pull every Kong service into `registry`
    ///
    /// Fails only when the list itself cannot be fetched.
    pub async fn sync_with_kong(&self, registry: &ServiceRegistry) -> Result<SyncSummary> {
        let entries = self.fetch_services().await?;
        let now = registry.clock().now();
        let mut summary = SyncSummary::default();

        for entry in entries {
            let label = entry
                .get("name")
                .and_then(|v| v.as_str())
                .or_else(|| entry.get("id").and_then(|v| v.as_str()))
                .unwrap_or("<unnamed>")
                .to_string();

            let registration = serde_json::from_value::<KongService>(entry)
                .map_err(Error::from)
                .and_then(|service| service.into_registration(now));

            match registration {
                Ok(registration) => {
                    registry.register_service(registration);
                    summary.record_ok(label);
                }
                Err(e) => {
                    warn!(service = %label, error = %e, "Failed to sync Kong service");
                    summary.record_error(label, e.to_string());
                }
            }
        }

        info!(
            synced = summary.synced,
            errors = summary.errors,
            "Kong sync complete"
        );
        Ok(summary)
    }
}
