//! Authentication collaborator
//!
//! Credential issuance and validation live outside the routing core. The
//! orchestrator only needs to ask whether a presented token is valid and,
//! if so, what the caller may do.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Per-key rate-limit hints carried by a credential
///
/// Each quota that is set replaces the matching route quota.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitHint {
    /// Requests allowed per minute, if capped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_minute: Option<u64>,
    /// Requests allowed per hour, if capped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_hour: Option<u64>,
}

/// A validated caller credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Stable identifier of the key (never the secret itself)
    pub key_id: String,
    /// Permissions granted to the key
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Optional per-key rate-limit override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitHint>,
}

impl Credential {
    /// Check whether the credential grants a permission
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions
            .iter()
            .any(|p| p == permission || p == "*")
    }
}

/// Validates API keys presented by callers
#[async_trait]
pub trait AuthValidator: Send + Sync {
    /// Validate a token, returning the credential if it is known
    ///
    /// `Ok(None)` means the token is not valid; `Err` means validation could
    /// not be performed.
    async fn validate_api_key(&self, token: &str) -> Result<Option<Credential>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_permission() {
        let credential = Credential {
            key_id: "ops".to_string(),
            permissions: vec!["read".to_string()],
            rate_limit: None,
        };
        assert!(credential.has_permission("read"));
        assert!(!credential.has_permission("write"));
    }

    #[test]
    fn test_wildcard_permission() {
        let credential = Credential {
            key_id: "admin".to_string(),
            permissions: vec!["*".to_string()],
            rate_limit: None,
        };
        assert!(credential.has_permission("anything"));
    }

    #[test]
    fn test_credential_deserialize_defaults() {
        let credential: Credential = serde_json::from_str(r#"{"key_id":"k1"}"#).unwrap();
        assert!(credential.permissions.is_empty());
        assert!(credential.rate_limit.is_none());
    }
}
