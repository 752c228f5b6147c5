//! Gatewarden Observability
//!
//! This crate provides observability features:
//! - Metrics collection (Prometheus)
//! - Structured logging

pub mod logging;
pub mod metrics;

pub use logging::{LogFormat, LoggingConfig, LoggingError, init_logging};
pub use metrics::{CircuitBreakerState, InstanceHealth, Metrics};
