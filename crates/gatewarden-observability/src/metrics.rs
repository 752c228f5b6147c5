//! Metrics collection with Prometheus
//!
//! This module provides Prometheus metrics for Gatewarden:
//! - Request counts and latency by route, service and outcome
//! - Circuit breaker state, transitions and short-circuits
//! - Rate limit decisions
//! - Instance health and active connections
//! - Service registry size and evictions
//! - Backend call latency

use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Metrics collector for Gatewarden
#[derive(Clone)]
pub struct Metrics {
    /// Prometheus registry
    registry: Arc<Registry>,

    // Request metrics
    /// Routed requests by outcome
    pub requests_total: CounterVec,
    /// End-to-end routing duration
    pub request_duration_seconds: HistogramVec,

    // Circuit breaker metrics
    /// Circuit breaker state (0=closed, 1=open, 2=half-open)
    pub circuit_breaker_state: GaugeVec,
    /// Circuit breaker state changes
    pub circuit_breaker_transitions: CounterVec,
    /// Calls short-circuited while open
    pub circuit_fallbacks: CounterVec,

    // Rate limit metrics
    /// Rate limit decisions (allowed, blocked, fail_open)
    pub rate_limit_decisions: CounterVec,

    // Load balancer metrics
    /// Instance health (0=unknown, 1=healthy, 2=unhealthy)
    pub instance_health: GaugeVec,
    /// In-flight calls per instance
    pub instance_active_connections: GaugeVec,

    // Registry metrics
    pub registered_services: Gauge,
    pub registry_evictions: CounterVec,

    // Backend metrics
    pub backend_duration_seconds: HistogramVec,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests_total = CounterVec::new(
            Opts::new("gatewarden_requests_total", "Total number of routed requests"),
            &["route", "service", "outcome"],
        )?;

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "gatewarden_request_duration_seconds",
                "Request routing duration in seconds",
            )
            .buckets(vec![
                0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
            &["route", "service"],
        )?;

        let circuit_breaker_state = GaugeVec::new(
            Opts::new(
                "gatewarden_circuit_breaker_state",
                "Circuit breaker state (0=closed, 1=open, 2=half-open)",
            ),
            &["circuit"],
        )?;

        let circuit_breaker_transitions = CounterVec::new(
            Opts::new(
                "gatewarden_circuit_breaker_transitions_total",
                "Circuit breaker state transitions",
            ),
            &["circuit", "from_state", "to_state"],
        )?;

        let circuit_fallbacks = CounterVec::new(
            Opts::new(
                "gatewarden_circuit_fallbacks_total",
                "Calls short-circuited by an open circuit",
            ),
            &["circuit"],
        )?;

        let rate_limit_decisions = CounterVec::new(
            Opts::new(
                "gatewarden_rate_limit_decisions_total",
                "Rate limit decisions by scope",
            ),
            &["scope", "decision"],
        )?;

        let instance_health = GaugeVec::new(
            Opts::new(
                "gatewarden_instance_health",
                "Instance health (0=unknown, 1=healthy, 2=unhealthy)",
            ),
            &["service", "instance"],
        )?;

        let instance_active_connections = GaugeVec::new(
            Opts::new(
                "gatewarden_instance_active_connections",
                "Active connections per instance",
            ),
            &["service", "instance"],
        )?;

        let registered_services = Gauge::with_opts(Opts::new(
            "gatewarden_registered_services",
            "Number of registrations in the service registry",
        ))?;

        let registry_evictions = CounterVec::new(
            Opts::new(
                "gatewarden_registry_evictions_total",
                "Registrations removed from the service registry",
            ),
            &["reason"],
        )?;

        let backend_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "gatewarden_backend_duration_seconds",
                "Backend call duration in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["service"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_duration_seconds.clone()))?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;
        registry.register(Box::new(circuit_breaker_transitions.clone()))?;
        registry.register(Box::new(circuit_fallbacks.clone()))?;
        registry.register(Box::new(rate_limit_decisions.clone()))?;
        registry.register(Box::new(instance_health.clone()))?;
        registry.register(Box::new(instance_active_connections.clone()))?;
        registry.register(Box::new(registered_services.clone()))?;
        registry.register(Box::new(registry_evictions.clone()))?;
        registry.register(Box::new(backend_duration_seconds.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            requests_total,
            request_duration_seconds,
            circuit_breaker_state,
            circuit_breaker_transitions,
            circuit_fallbacks,
            rate_limit_decisions,
            instance_health,
            instance_active_connections,
            registered_services,
            registry_evictions,
            backend_duration_seconds,
        })
    }

    /// Get the Prometheus registry for exporting metrics
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every metric in the Prometheus text exposition format
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    /// Record a routed request
    pub fn record_request(&self, route: &str, service: &str, outcome: &str, duration_secs: f64) {
        self.requests_total
            .with_label_values(&[route, service, outcome])
            .inc();
        self.request_duration_seconds
            .with_label_values(&[route, service])
            .observe(duration_secs);
    }

    /// Update circuit breaker state
    pub fn update_circuit_breaker_state(&self, circuit: &str, state: CircuitBreakerState) {
        self.circuit_breaker_state
            .with_label_values(&[circuit])
            .set(state as i64 as f64);
    }

    /// Record circuit breaker transition and the resulting state
    pub fn record_circuit_breaker_transition(
        &self,
        circuit: &str,
        from: CircuitBreakerState,
        to: CircuitBreakerState,
    ) {
        self.circuit_breaker_transitions
            .with_label_values(&[circuit, from.as_str(), to.as_str()])
            .inc();
        self.update_circuit_breaker_state(circuit, to);
    }

    /// Record a call short-circuited by an open breaker
    pub fn record_fallback(&self, circuit: &str) {
        self.circuit_fallbacks.with_label_values(&[circuit]).inc();
    }

    /// Record a rate limit decision
    pub fn record_rate_limit(&self, scope: &str, decision: &str) {
        self.rate_limit_decisions
            .with_label_values(&[scope, decision])
            .inc();
    }

    /// Update instance health
    pub fn update_instance_health(&self, service: &str, instance: &str, health: InstanceHealth) {
        self.instance_health
            .with_label_values(&[service, instance])
            .set(health as i64 as f64);
    }

    pub fn set_active_connections(&self, service: &str, instance: &str, count: u64) {
        self.instance_active_connections
            .with_label_values(&[service, instance])
            .set(count as f64);
    }

    pub fn set_registered_services(&self, count: usize) {
        self.registered_services.set(count as f64);
    }

    /// Record a registration removed from the registry
    pub fn record_registry_eviction(&self, reason: &str) {
        self.registry_evictions.with_label_values(&[reason]).inc();
    }

    pub fn record_backend_duration(&self, service: &str, duration_secs: f64) {
        self.backend_duration_seconds
            .with_label_values(&[service])
            .observe(duration_secs);
    }
}

/// Circuit breaker state for metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CircuitBreakerState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl CircuitBreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Instance health for metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InstanceHealth {
    Unknown = 0,
    Healthy = 1,
    Unhealthy = 2,
}
