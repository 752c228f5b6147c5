//! Gatewarden Routing Core
//!
//! This crate provides the request-handling core of the gateway:
//! - Circuit breakers per target
//! - Load balancing with active health checks
//! - Fixed-window rate limiting over a shared counter store
//! - Service registry with heartbeat liveness and stale sweeps
//! - Route table with API version resolution
//! - The orchestrator that sequences all of the above per request

pub mod auth;
pub mod backend;
pub mod circuit_breaker;
pub mod config;
pub mod counter_store;
pub mod health;
pub mod kong_sync;
pub mod load_balancer;
pub mod orchestrator;
pub mod rate_limiter;
pub mod registry;
pub mod router;

// Re-export commonly used types
pub use auth::{ApiKeyEntry, StaticKeyValidator};
pub use backend::{Backend, BackendConfig, BackendRequest, HttpBackend};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, CircuitStats,
    SharedCircuitBreakerRegistry,
};
pub use config::{GatewayConfig, InstanceDefinition, ServiceDefinition};
pub use counter_store::MemoryCounterStore;
pub use health::{HealthCheckConfig, HealthProbe, HealthStatus};
pub use kong_sync::{KongSync, SyncSummary};
pub use load_balancer::{Algorithm, LoadBalancer, LoadBalancerConfig, ServiceInstance, ServiceStats};
pub use orchestrator::{HealthReport, RequestContext, RouteOutcome, RoutingOrchestrator};
pub use rate_limiter::{RateLimitConfig, RateLimitProfiles, RateLimitResult, RateLimiter};
pub use registry::{RegistryConfig, ServiceRegistration, ServiceRegistry};
pub use router::{RouteDescriptor, RouteTable};
