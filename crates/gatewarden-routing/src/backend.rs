//! Backend invocation
//!
//! Forwards a routed request to `instance.url + path` and decodes the JSON
//! reply. Any non-2xx status is a backend failure, which the circuit breaker
//! counts against the service.

use async_trait::async_trait;
use gatewarden_core::{Error, Result};
use reqwest::{Client, ClientBuilder, Method};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use crate::load_balancer::ServiceInstance;

/// Request headers copied to the backend
pub const FORWARDED_HEADERS: &[&str] = &[
    "accept",
    "content-type",
    "x-request-id",
    "x-correlation-id",
    "x-forwarded-for",
    "x-real-ip",
];

/// HTTP client settings for backend calls
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_timeout_ms() -> u64 {
    3_000
}

fn default_connect_timeout_ms() -> u64 {
    2_000
}

fn default_user_agent() -> String {
    format!("Gatewarden/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            user_agent: default_user_agent(),
        }
    }
}

/// A request as forwarded to one instance
#[derive(Debug, Clone, PartialEq)]
pub struct BackendRequest {
    pub method: String,
    /// Canonical path, version prefix already stripped
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Option<serde_json::Value>,
}

/// Invokes a backend instance
#[async_trait]
pub trait Backend: Send + Sync {
    async fn call(
        &self,
        instance: &ServiceInstance,
        request: &BackendRequest,
    ) -> Result<serde_json::Value>;
}

/// `reqwest`-based backend
pub struct HttpBackend {
    client: Client,
}

impl HttpBackend {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let client = ClientBuilder::new()
            .timeout(Duration::from_millis(config.timeout_ms))
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn call(
        &self,
        instance: &ServiceInstance,
        request: &BackendRequest,
    ) -> Result<serde_json::Value> {
        let method = Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| Error::BackendFailure(format!("Invalid method {}", request.method)))?;
        let url = format!("{}{}", instance.url.trim_end_matches('/'), request.path);

        let mut builder = self.client.request(method, &url);
        for (name, value) in &request.headers {
            if FORWARDED_HEADERS
                .iter()
                .any(|h| h.eq_ignore_ascii_case(name))
            {
                builder = builder.header(name.as_str(), value.as_str());
            }
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        debug!(instance = %instance.id, url = %url, "Calling backend");
        let response = builder
            .send()
            .await
            .map_err(|e| Error::BackendFailure(format!("{} {}: {}", request.method, url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::BackendFailure(format!(
                "{} returned {}",
                url, status
            )));
        }

        let text = response
            .text()
            .await
            .map_err(|e| Error::BackendFailure(format!("Failed to read body from {}: {}", url, e)))?;
        if text.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        Ok(serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text)))
    }
}
