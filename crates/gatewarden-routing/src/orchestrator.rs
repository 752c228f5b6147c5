//! Request routing pipeline
//!
//! Each request runs through, in order:
//! - version resolution and route matching (404)
//! - credential validation for protected routes (401)
//! - the route's rate limit, keyed by client address (429)
//! - the circuit breaker named after the target service, inside which a
//!   live registration and a load-balanced instance are resolved and the
//!   backend is called (500 on any failure)
//!
//! Every path returns a [`RouteOutcome`]; nothing here panics or bubbles
//! an error to the caller.

use chrono::{DateTime, Utc};
use gatewarden_core::clock::SharedClock;
use gatewarden_core::{AuthValidator, Credential, Error, Result};
use gatewarden_observability::Metrics;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::auth::StaticKeyValidator;
use crate::backend::{Backend, BackendRequest, HttpBackend};
use crate::circuit_breaker::{CircuitBreakerRegistry, CircuitState, CircuitStats};
use crate::config::GatewayConfig;
use crate::counter_store::MemoryCounterStore;
use crate::load_balancer::{LoadBalancer, ServiceStats};
use crate::rate_limiter::{RateLimitConfig, RateLimitResult, RateLimiter};
use crate::registry::{RegistryStats, ServiceRegistration, ServiceRegistry};
use crate::router::{RouteDescriptor, RouteTable, resolve_version};

const UNKNOWN_CLIENT: &str = "unknown";
const INTERNAL_ERROR: &str = "Internal server error";

/// An inbound request, independent of any transport
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestContext {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Option<serde_json::Value>,
}

impl RequestContext {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            headers: HashMap::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Caller address from `x-forwarded-for` (first hop) or `x-real-ip`
    pub fn client_ip(&self) -> Option<&str> {
        self.header("x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .or_else(|| {
                self.header("x-real-ip")
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
            })
    }

    /// API key from `x-api-key` or an `Authorization: Bearer` header
    pub fn api_key(&self) -> Option<&str> {
        self.header("x-api-key")
            .or_else(|| {
                self.header("authorization")
                    .and_then(|v| v.strip_prefix("Bearer "))
            })
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }
}

/// Normalised result of one routed request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 200, 401, 404, 429 or 500
    pub status: u16,
    pub api_version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    /// Breaker state observed after the call
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_state: Option<CircuitState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_time: Option<DateTime<Utc>>,
}

impl RouteOutcome {
    fn success(data: serde_json::Value, api_version: u32) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            status: 200,
            api_version,
            service: None,
            circuit_state: None,
            remaining: None,
            reset_time: None,
        }
    }

    fn failure(err: &Error, api_version: u32) -> Self {
        let (remaining, reset_time) = match err {
            Error::RateLimited {
                remaining,
                reset_time,
            } => (Some(*remaining), Some(*reset_time)),
            _ => (None, None),
        };
        Self {
            success: false,
            data: None,
            error: Some(err.to_string()),
            status: err.status_class(),
            api_version,
            service: None,
            circuit_state: None,
            remaining,
            reset_time,
        }
    }

    fn internal_error(api_version: u32) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(INTERNAL_ERROR.to_string()),
            status: 500,
            api_version,
            service: None,
            circuit_state: None,
            remaining: None,
            reset_time: None,
        }
    }

    fn for_service(mut self, service: &str, state: CircuitState) -> Self {
        self.service = Some(service.to_string());
        self.circuit_state = Some(state);
        self
    }
}

/// Aggregate view of every component
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// `healthy`, or `degraded` when any circuit is not closed
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub circuits: Vec<CircuitStats>,
    pub load_balancer: Vec<ServiceStats>,
    pub registry: RegistryStats,
}

/// Decrements the instance's connection count when dropped, including
/// when the breaker times the call out
struct ConnectionGuard<'a> {
    load_balancer: &'a LoadBalancer,
    service: &'a str,
    instance_id: String,
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        self.load_balancer
            .decrement_connections(self.service, &self.instance_id);
    }
}

/// Composes routing, auth, rate limiting and the protected backend call
pub struct RoutingOrchestrator {
    routes: RouteTable,
    circuit_breakers: Arc<CircuitBreakerRegistry>,
    load_balancer: Arc<LoadBalancer>,
    rate_limiter: Arc<RateLimiter>,
    registry: Arc<ServiceRegistry>,
    backend: Arc<dyn Backend>,
    auth: Option<Arc<dyn AuthValidator>>,
    metrics: Option<Arc<Metrics>>,
    clock: SharedClock,
}

impl RoutingOrchestrator {
    pub fn new(
        routes: RouteTable,
        circuit_breakers: Arc<CircuitBreakerRegistry>,
        load_balancer: Arc<LoadBalancer>,
        rate_limiter: Arc<RateLimiter>,
        registry: Arc<ServiceRegistry>,
        backend: Arc<dyn Backend>,
    ) -> Self {
        Self {
            routes,
            circuit_breakers,
            load_balancer,
            rate_limiter,
            registry,
            backend,
            auth: None,
            metrics: None,
            clock: gatewarden_core::clock::system_clock(),
        }
    }

    pub fn with_auth(mut self, auth: Arc<dyn AuthValidator>) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Clock used for report timestamps
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Wire every component from configuration
    ///
    /// Configured services are registered with the load balancer and, one
    /// registration per instance, with the service registry. Must be called
    /// inside a Tokio runtime for health checks and heartbeat watchdogs to
    /// start.
    pub fn from_config(
        config: &GatewayConfig,
        clock: SharedClock,
        metrics: Option<Arc<Metrics>>,
    ) -> Result<Self> {
        let mut circuit_breakers =
            CircuitBreakerRegistry::with_clock(config.circuit_breaker.clone(), clock.clone());
        let mut load_balancer = LoadBalancer::with_clock(config.load_balancer.clone(), clock.clone());
        let store = Arc::new(MemoryCounterStore::with_clock(clock.clone()));
        let mut rate_limiter =
            RateLimiter::with_clock(store, config.rate_limits.clone(), clock.clone());
        let mut registry = ServiceRegistry::with_clock(config.registry.clone(), clock.clone());

        if let Some(metrics) = &metrics {
            circuit_breakers = circuit_breakers.with_metrics(metrics.clone());
            load_balancer = load_balancer.with_metrics(metrics.clone());
            rate_limiter = rate_limiter.with_metrics(metrics.clone());
            registry = registry.with_metrics(metrics.clone());
        }

        for service in &config.services {
            let instances = service.instances.iter().map(|i| i.to_instance()).collect();
            load_balancer.register_service(&service.name, instances, Some(service.service_config()));

            for instance in &service.instances {
                registry.register_service(
                    ServiceRegistration::new(
                        format!("{}-{}", service.name, instance.id),
                        &service.name,
                        &instance.url,
                        &service.version,
                    )
                    .with_last_heartbeat(clock.now()),
                );
            }
        }
        registry.spawn_stale_sweep();

        let backend = Arc::new(HttpBackend::new(&config.backend)?);
        let mut orchestrator = Self::new(
            RouteTable::new(config.routes.clone()),
            Arc::new(circuit_breakers),
            Arc::new(load_balancer),
            Arc::new(rate_limiter),
            Arc::new(registry),
            backend,
        )
        .with_clock(clock);

        if !config.api_keys.is_empty() {
            orchestrator = orchestrator.with_auth(Arc::new(StaticKeyValidator::new(&config.api_keys)));
        }
        if let Some(metrics) = metrics {
            orchestrator = orchestrator.with_metrics(metrics);
        }

        info!(
            routes = config.routes.len(),
            services = config.services.len(),
            "Routing orchestrator ready"
        );
        Ok(orchestrator)
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn circuit_breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.circuit_breakers
    }

    pub fn load_balancer(&self) -> &Arc<LoadBalancer> {
        &self.load_balancer
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Route one request
    pub async fn route_request(&self, request: &RequestContext) -> RouteOutcome {
        let started = Instant::now();
        let resolved = resolve_version(&request.path);
        let version = resolved.version;

        let Some(route) = self
            .routes
            .find_route(&resolved.canonical_path, &request.method)
        else {
            let err = Error::RouteNotFound {
                method: request.method.clone(),
                path: resolved.canonical_path,
            };
            debug!(error = %err, "No route");
            self.record("unmatched", "none", err.kind(), started);
            return RouteOutcome::failure(&err, version);
        };

        let credential = if route.auth_required {
            match self.authenticate(request).await {
                Ok(credential) => Some(credential),
                Err(err) => {
                    self.record(&route.path, &route.service, err.kind(), started);
                    return RouteOutcome::failure(&err, version);
                }
            }
        } else {
            None
        };

        if let Err(err) = self
            .enforce_rate_limit(route, request, credential.as_ref())
            .await
        {
            self.record(&route.path, &route.service, err.kind(), started);
            return RouteOutcome::failure(&err, version);
        }

        let service = route.service.as_str();
        let backend_request = BackendRequest {
            method: request.method.to_ascii_uppercase(),
            path: resolved.canonical_path,
            headers: request.headers.clone(),
            body: request.body.clone(),
        };
        let client_ip = request.client_ip();

        let result = self
            .circuit_breakers
            .execute(service, || {
                self.call_service(service, &backend_request, client_ip)
            })
            .await;
        let state = self.circuit_breakers.state(service);

        match result {
            Ok(data) => {
                self.record(&route.path, service, "success", started);
                RouteOutcome::success(data, version).for_service(service, state)
            }
            Err(err) => {
                warn!(
                    service = %service,
                    circuit_state = state.as_str(),
                    error = %err,
                    "Routed request failed"
                );
                self.record(&route.path, service, err.kind(), started);
                RouteOutcome::internal_error(version).for_service(service, state)
            }
        }
    }

    async fn authenticate(&self, request: &RequestContext) -> Result<Credential> {
        let Some(token) = request.api_key() else {
            return Err(Error::Unauthorized("missing API key".to_string()));
        };
        let Some(auth) = &self.auth else {
            error!("Route requires auth but no validator is configured");
            return Err(Error::Unauthorized("authentication unavailable".to_string()));
        };

        match auth.validate_api_key(token).await {
            Ok(Some(credential)) => Ok(credential),
            Ok(None) => Err(Error::Unauthorized("invalid API key".to_string())),
            Err(err) => {
                error!(error = %err, "API key validation failed");
                Err(Error::Unauthorized("API key could not be validated".to_string()))
            }
        }
    }

    /// Apply the route quota, plus an hourly quota when one is configured
    ///
    /// Credential hints take precedence over the route's own quota.
    async fn enforce_rate_limit(
        &self,
        route: &RouteDescriptor,
        request: &RequestContext,
        credential: Option<&Credential>,
    ) -> Result<()> {
        let client = request.client_ip().unwrap_or(UNKNOWN_CLIENT);

        let hint = credential.and_then(|c| c.rate_limit).unwrap_or_default();
        let per_minute = hint
            .per_minute
            .or(route.rate_limit.map(|limit| limit.per_minute));
        let per_hour = hint
            .per_hour
            .or(route.rate_limit.and_then(|limit| limit.per_hour));

        let minute_config = per_minute
            .map(RateLimitConfig::per_minute)
            .unwrap_or(self.rate_limiter.profiles().route_default);
        let minute = self
            .rate_limiter
            .check_rate_limit(&format!("route:{}:{}", route.path, client), &minute_config)
            .await;
        check_blocked(minute)?;

        if let Some(per_hour) = per_hour {
            let hour = self
                .rate_limiter
                .check_rate_limit(
                    &format!("hourly:{}:{}", route.path, client),
                    &RateLimitConfig::per_hour(per_hour),
                )
                .await;
            check_blocked(hour)?;
        }

        Ok(())
    }

    /// Body of the protected call
    async fn call_service(
        &self,
        service: &str,
        request: &BackendRequest,
        client_ip: Option<&str>,
    ) -> Result<serde_json::Value> {
        if self.registry.get_services_by_name(service).is_empty() {
            return Err(Error::NoHealthyInstance(service.to_string()));
        }

        let instance = self
            .load_balancer
            .get_next_instance(service, None, client_ip)
            .ok_or_else(|| Error::NoHealthyInstance(service.to_string()))?;

        self.load_balancer
            .increment_connections(service, &instance.id);
        let _guard = ConnectionGuard {
            load_balancer: &self.load_balancer,
            service,
            instance_id: instance.id.clone(),
        };

        let started = Instant::now();
        let result = self.backend.call(&instance, request).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_backend_duration(service, started.elapsed().as_secs_f64());
        }
        result
    }

    fn record(&self, route: &str, service: &str, outcome: &str, started: Instant) {
        if let Some(metrics) = &self.metrics {
            metrics.record_request(route, service, outcome, started.elapsed().as_secs_f64());
        }
    }

    /// Snapshot of breakers, pools and registry
    pub fn health_report(&self) -> HealthReport {
        let circuits = self.circuit_breakers.get_all_stats();
        let degraded = circuits.iter().any(|c| c.state != CircuitState::Closed);

        HealthReport {
            status: if degraded { "degraded" } else { "healthy" },
            timestamp: self.clock.now(),
            circuits,
            load_balancer: self.load_balancer.get_all_stats(),
            registry: self.registry.get_registry_stats(),
        }
    }

    /// Stop health checks, heartbeat watchdogs and the stale sweep
    pub fn shutdown(&self) {
        self.load_balancer.shutdown();
        self.registry.shutdown();
    }
}

fn check_blocked(result: RateLimitResult) -> Result<()> {
    if result.blocked {
        return Err(Error::RateLimited {
            remaining: result.remaining,
            reset_time: result.reset_time,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::load_balancer::{LoadBalancerConfig, ServiceInstance};
    use crate::rate_limiter::RateLimitProfiles;
    use crate::registry::RegistryConfig;
    use async_trait::async_trait;
    use gatewarden_core::{Clock, ManualClock, RateLimitHint};
    use mockall::mock;
    use serde_json::json;

    mock! {
        pub TestBackend {}

        #[async_trait]
        impl Backend for TestBackend {
            async fn call(
                &self,
                instance: &ServiceInstance,
                request: &BackendRequest,
            ) -> Result<serde_json::Value>;
        }
    }

    mock! {
        pub Validator {}

        #[async_trait]
        impl AuthValidator for Validator {
            async fn validate_api_key(&self, token: &str) -> Result<Option<Credential>>;
        }
    }

    fn routes() -> RouteTable {
        RouteTable::new(vec![
            RouteDescriptor::new("/api/users", "users").with_methods(&["GET", "POST"]),
            RouteDescriptor::new("/api/admin", "users").with_auth(),
            RouteDescriptor::new("/api/limited", "users").with_rate_limit(2, None),
            RouteDescriptor::new("/api/ghost", "ghost"),
        ])
    }

    fn gateway(backend: MockTestBackend) -> RoutingOrchestrator {
        let clock: SharedClock = Arc::new(ManualClock::at_millis(1_000_000));
        let load_balancer = LoadBalancer::with_clock(
            LoadBalancerConfig {
                health_check: crate::health::HealthCheckConfig {
                    enabled: false,
                    ..Default::default()
                },
                ..Default::default()
            },
            clock.clone(),
        );
        load_balancer.register_service(
            "users",
            vec![
                ServiceInstance::new("u1", "http://10.0.0.1"),
                ServiceInstance::new("u2", "http://10.0.0.2"),
            ],
            None,
        );
        let registry = ServiceRegistry::with_clock(RegistryConfig::default(), clock.clone());
        registry.register_service(
            ServiceRegistration::new("users-u1", "users", "http://10.0.0.1", "1.0.0")
                .with_last_heartbeat(clock.now()),
        );

        let store = Arc::new(MemoryCounterStore::with_clock(clock.clone()));
        RoutingOrchestrator::new(
            routes(),
            Arc::new(CircuitBreakerRegistry::with_clock(
                CircuitBreakerConfig::default(),
                clock.clone(),
            )),
            Arc::new(load_balancer),
            Arc::new(RateLimiter::with_clock(
                store,
                RateLimitProfiles::default(),
                clock.clone(),
            )),
            Arc::new(registry),
            Arc::new(backend),
        )
        .with_clock(clock)
    }

    #[test]
    fn test_request_context_headers() {
        let request = RequestContext::new("GET", "/")
            .with_header("X-Forwarded-For", "203.0.113.7, 10.0.0.1")
            .with_header("Authorization", "Bearer tok-1");
        assert_eq!(request.client_ip(), Some("203.0.113.7"));
        assert_eq!(request.api_key(), Some("tok-1"));

        let request = RequestContext::new("GET", "/").with_header("x-real-ip", "198.51.100.2");
        assert_eq!(request.client_ip(), Some("198.51.100.2"));
        assert_eq!(request.api_key(), None);
    }

    #[tokio::test]
    async fn test_routes_to_backend_with_canonical_path() {
        let mut backend = MockTestBackend::new();
        backend
            .expect_call()
            .withf(|instance, request| {
                instance.id == "u1" && request.path == "/api/users/7" && request.method == "GET"
            })
            .times(1)
            .returning(|_, _| Ok(json!({"id": 7})));

        let gw = gateway(backend);
        let outcome = gw
            .route_request(&RequestContext::new("get", "/api/v2/users/7"))
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.status, 200);
        assert_eq!(outcome.api_version, 2);
        assert_eq!(outcome.data, Some(json!({"id": 7})));
        assert_eq!(outcome.circuit_state, Some(CircuitState::Closed));

        // The connection was released
        let stats = gw.load_balancer().get_service_stats("users").unwrap();
        assert_eq!(stats.total_active_connections, 0);
    }

    #[tokio::test]
    async fn test_unknown_route_is_not_found() {
        let mut backend = MockTestBackend::new();
        backend.expect_call().never();

        let gw = gateway(backend);
        let outcome = gw.route_request(&RequestContext::new("GET", "/nowhere")).await;
        assert!(!outcome.success);
        assert_eq!(outcome.status, 404);

        // Method not allowed on the matching prefix
        let outcome = gw
            .route_request(&RequestContext::new("DELETE", "/api/users"))
            .await;
        assert_eq!(outcome.status, 404);
        assert!(gw.circuit_breakers().get_all_stats().is_empty());
    }

    #[tokio::test]
    async fn test_auth_required() {
        let mut backend = MockTestBackend::new();
        backend
            .expect_call()
            .times(1)
            .returning(|_, _| Ok(json!("ok")));

        let mut validator = MockValidator::new();
        validator
            .expect_validate_api_key()
            .returning(|token| {
                Ok((token == "good").then(|| Credential {
                    key_id: "ops".to_string(),
                    permissions: vec![],
                    rate_limit: None,
                }))
            });

        let gw = gateway(backend).with_auth(Arc::new(validator));

        let missing = gw.route_request(&RequestContext::new("GET", "/api/admin")).await;
        assert_eq!(missing.status, 401);

        let bad = gw
            .route_request(&RequestContext::new("GET", "/api/admin").with_header("x-api-key", "bad"))
            .await;
        assert_eq!(bad.status, 401);

        let good = gw
            .route_request(&RequestContext::new("GET", "/api/admin").with_header("x-api-key", "good"))
            .await;
        assert!(good.success);
    }

    #[tokio::test]
    async fn test_validator_error_is_unauthorized() {
        let backend = MockTestBackend::new();
        let mut validator = MockValidator::new();
        validator
            .expect_validate_api_key()
            .returning(|_| Err(Error::StoreUnavailable("down".to_string())));

        let gw = gateway(backend).with_auth(Arc::new(validator));
        let outcome = gw
            .route_request(&RequestContext::new("GET", "/api/admin").with_header("x-api-key", "k"))
            .await;
        assert_eq!(outcome.status, 401);
    }

    #[tokio::test]
    async fn test_rate_limited_after_route_quota() {
        let mut backend = MockTestBackend::new();
        backend
            .expect_call()
            .times(3)
            .returning(|_, _| Ok(json!("ok")));

        let gw = gateway(backend);
        let request = RequestContext::new("GET", "/api/limited").with_header("x-real-ip", "1.2.3.4");

        assert!(gw.route_request(&request).await.success);
        assert!(gw.route_request(&request).await.success);

        let blocked = gw.route_request(&request).await;
        assert_eq!(blocked.status, 429);
        assert_eq!(blocked.remaining, Some(0));
        assert!(blocked.reset_time.is_some());

        // Another client has its own window
        let other = gw.route_request(&RequestContext::new("GET", "/api/limited")).await;
        assert_eq!(other.status, 200);
    }

    #[tokio::test]
    async fn test_credential_hint_overrides_route_quota() {
        let mut backend = MockTestBackend::new();
        backend.expect_call().returning(|_, _| Ok(json!("ok")));

        let mut validator = MockValidator::new();
        validator.expect_validate_api_key().returning(|_| {
            Ok(Some(Credential {
                key_id: "tight".to_string(),
                permissions: vec![],
                rate_limit: Some(RateLimitHint {
                    per_minute: Some(1),
                    per_hour: None,
                }),
            }))
        });

        let gw = gateway(backend).with_auth(Arc::new(validator));
        let request = RequestContext::new("GET", "/api/admin").with_header("x-api-key", "k");
        assert!(gw.route_request(&request).await.success);
        assert_eq!(gw.route_request(&request).await.status, 429);
    }

    #[tokio::test]
    async fn test_hourly_only_hint_is_enforced() {
        let mut backend = MockTestBackend::new();
        backend.expect_call().times(1).returning(|_, _| Ok(json!("ok")));

        let mut validator = MockValidator::new();
        validator.expect_validate_api_key().returning(|_| {
            Ok(Some(Credential {
                key_id: "batch".to_string(),
                permissions: vec![],
                rate_limit: Some(RateLimitHint {
                    per_minute: None,
                    per_hour: Some(1),
                }),
            }))
        });

        let gw = gateway(backend).with_auth(Arc::new(validator));
        let request = RequestContext::new("GET", "/api/admin").with_header("x-api-key", "k");
        assert!(gw.route_request(&request).await.success);

        let blocked = gw.route_request(&request).await;
        assert_eq!(blocked.status, 429);
        let reset = blocked.reset_time.unwrap();
        assert_eq!(reset.timestamp_millis(), 3_600_000);
    }

    #[tokio::test]
    async fn test_static_registrations_follow_injected_clock() {
        let config: GatewayConfig = serde_yaml::from_str(
            r#"
load_balancer:
  health_check:
    enabled: false
routes:
  - path: /api/users
    service: users
services:
  - name: users
    instances:
      - id: i1
        url: http://127.0.0.1:9
"#,
        )
        .unwrap();
        let clock = Arc::new(ManualClock::at_millis(1_000_000));
        let gw = RoutingOrchestrator::from_config(&config, clock.clone(), None).unwrap();

        let registration = gw.registry().get_service("users-i1").unwrap();
        assert_eq!(registration.last_heartbeat, clock.now());
        assert!(gw.registry().has_stale_sweep());

        clock.advance(std::time::Duration::from_millis(
            config.registry.heartbeat_timeout_ms + 1,
        ));
        assert_eq!(gw.registry().check_all_heartbeats(), 1);

        let outcome = gw
            .route_request(&RequestContext::new("GET", "/api/users"))
            .await;
        assert_eq!(outcome.status, 500);

        clock.advance(std::time::Duration::from_millis(config.registry.max_age_ms));
        assert_eq!(
            gw.registry().sweep_stale_services(),
            vec!["users-i1".to_string()]
        );

        gw.shutdown();
        assert!(!gw.registry().has_stale_sweep());
    }

    #[tokio::test]
    async fn test_missing_registration_counts_as_circuit_failure() {
        let mut backend = MockTestBackend::new();
        backend.expect_call().never();

        let gw = gateway(backend);
        let outcome = gw.route_request(&RequestContext::new("GET", "/api/ghost")).await;

        assert_eq!(outcome.status, 500);
        assert_eq!(outcome.error.as_deref(), Some(INTERNAL_ERROR));
        assert_eq!(outcome.service.as_deref(), Some("ghost"));
        let stats = gw.circuit_breakers().get_stats("ghost").unwrap();
        assert_eq!(stats.failure_count, 1);
    }

    #[tokio::test]
    async fn test_backend_failures_open_the_circuit() {
        let mut backend = MockTestBackend::new();
        backend
            .expect_call()
            .times(10)
            .returning(|_, _| Err(Error::BackendFailure("502".to_string())));

        let gw = gateway(backend);
        let request = RequestContext::new("GET", "/api/users");
        for _ in 0..10 {
            assert_eq!(gw.route_request(&request).await.status, 500);
        }

        // Open circuit short-circuits without calling the backend
        let outcome = gw.route_request(&request).await;
        assert_eq!(outcome.status, 500);
        assert_eq!(outcome.circuit_state, Some(CircuitState::Open));

        let report = gw.health_report();
        assert_eq!(report.status, "degraded");
        assert_eq!(report.circuits[0].name, "users");
    }

    #[tokio::test]
    async fn test_health_report_when_idle() {
        let gw = gateway(MockTestBackend::new());
        let report = gw.health_report();
        assert_eq!(report.status, "healthy");
        assert_eq!(report.registry.total, 1);
        assert_eq!(report.load_balancer.len(), 1);
        gw.shutdown();
    }
}
