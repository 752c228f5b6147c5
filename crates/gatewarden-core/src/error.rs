//! Error types for Gatewarden Core

use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("No route matches {method} {path}")]
    RouteNotFound { method: String, path: String },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Rate limit exceeded: {remaining} remaining, resets at {reset_time}")]
    RateLimited {
        remaining: u64,
        reset_time: DateTime<Utc>,
    },

    #[error("No healthy instance available for service '{0}'")]
    NoHealthyInstance(String),

    #[error("Circuit breaker '{0}' is open")]
    CircuitOpen(String),

    #[error("Backend failure: {0}")]
    BackendFailure(String),

    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(String),

    // Registry errors
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Control plane error: {0}")]
    ControlPlane(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Numeric status classification for this error.
    ///
    /// The classification is a taxonomy shared with the HTTP adapter layer,
    /// not a transport detail: 404 not found, 401 unauthorized,
    /// 429 rate limited, 503 circuit open, 500 for everything else.
    pub fn status_class(&self) -> u16 {
        match self {
            Error::RouteNotFound { .. } => 404,
            Error::Unauthorized(_) => 401,
            Error::RateLimited { .. } => 429,
            Error::CircuitOpen(_) => 503,
            _ => 500,
        }
    }

    /// Short machine-readable label, used for metrics and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            Error::RouteNotFound { .. } => "route_not_found",
            Error::Unauthorized(_) => "unauthorized",
            Error::RateLimited { .. } => "rate_limited",
            Error::NoHealthyInstance(_) => "no_healthy_instance",
            Error::CircuitOpen(_) => "circuit_open",
            Error::BackendFailure(_) => "backend_failure",
            Error::StoreUnavailable(_) => "store_unavailable",
            Error::ServiceNotFound(_) => "service_not_found",
            Error::Config(_) => "config",
            Error::ControlPlane(_) => "control_plane",
            Error::Serialization(_) => "serialization",
            Error::Io(_) => "io",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
