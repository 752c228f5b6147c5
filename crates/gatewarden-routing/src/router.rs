//! Route table and API version resolution
//!
//! Requests may carry a version prefix (`/api/v2/users`). The prefix is
//! stripped to a canonical path (`/api/users`) before matching; requests
//! without one are version 1. Among the routes allowing the method, the
//! longest path prefix wins, matched on segment boundaries.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const DEFAULT_API_VERSION: u32 = 1;

static VERSION_PREFIX: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^/api/v(\d+)/").ok());

/// Per-route quota
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRateLimit {
    pub per_minute: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_hour: Option<u64>,
}

/// Static route configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDescriptor {
    /// Path prefix on the canonical (unversioned) path
    pub path: String,

    /// Target service name
    pub service: String,

    /// Allowed methods; empty allows any
    #[serde(default)]
    pub methods: Vec<String>,

    #[serde(default)]
    pub auth_required: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RouteRateLimit>,
}

impl RouteDescriptor {
    pub fn new(path: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            service: service.into(),
            methods: Vec::new(),
            auth_required: false,
            rate_limit: None,
        }
    }

    pub fn with_methods(mut self, methods: &[&str]) -> Self {
        self.methods = methods.iter().map(|m| m.to_uppercase()).collect();
        self
    }

    pub fn with_auth(mut self) -> Self {
        self.auth_required = true;
        self
    }

    pub fn with_rate_limit(mut self, per_minute: u64, per_hour: Option<u64>) -> Self {
        self.rate_limit = Some(RouteRateLimit {
            per_minute,
            per_hour,
        });
        self
    }

    pub fn allows_method(&self, method: &str) -> bool {
        self.methods.is_empty() || self.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
    }

    /// Prefix match on a segment boundary
    pub fn matches_path(&self, path: &str) -> bool {
        let prefix = self.path.as_str();
        if !path.starts_with(prefix) {
            return false;
        }
        path.len() == prefix.len() || prefix.ends_with('/') || path[prefix.len()..].starts_with('/')
    }
}

/// A request path with its version prefix removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    pub version: u32,
    pub canonical_path: String,
}

/// Strip the `/api/v<N>/` prefix, if any
pub fn resolve_version(path: &str) -> ResolvedPath {
    let path = path.split(['?', '#']).next().unwrap_or(path);

    let versioned = VERSION_PREFIX.as_ref().and_then(|re| re.captures(path)).and_then(|caps| {
        let whole = caps.get(0)?;
        let version = caps.get(1)?.as_str().parse::<u32>().ok()?;
        Some((version, whole.end()))
    });

    match versioned {
        Some((version, end)) => ResolvedPath {
            version,
            canonical_path: format!("/api/{}", &path[end..]),
        },
        None => ResolvedPath {
            version: DEFAULT_API_VERSION,
            canonical_path: path.to_string(),
        },
    }
}

/// Ordered set of routes
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<RouteDescriptor>,
}

impl RouteTable {
    pub fn new(routes: Vec<RouteDescriptor>) -> Self {
        Self { routes }
    }

    pub fn add_route(&mut self, route: RouteDescriptor) {
        self.routes.push(route);
    }

    pub fn routes(&self) -> &[RouteDescriptor] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Best route for a canonical path and method
    ///
    /// Longest prefix wins; among equal prefixes the first configured wins.
    pub fn find_route(&self, canonical_path: &str, method: &str) -> Option<&RouteDescriptor> {
        let mut best: Option<&RouteDescriptor> = None;
        for route in &self.routes {
            if !route.allows_method(method) || !route.matches_path(canonical_path) {
                continue;
            }
            if best.is_none_or(|current| route.path.len() > current.path.len()) {
                best = Some(route);
            }
        }
        best
    }
}
