//! Static API-key validation from configuration

use async_trait::async_trait;
use gatewarden_core::{AuthValidator, Credential, RateLimitHint, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// One configured API key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyEntry {
    pub key: String,
    pub key_id: String,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_minute: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_hour: Option<u64>,
}

impl ApiKeyEntry {
    fn credential(&self) -> Credential {
        Credential {
            key_id: self.key_id.clone(),
            permissions: self.permissions.clone(),
            rate_limit: (self.per_minute.is_some() || self.per_hour.is_some()).then_some(
                RateLimitHint {
                    per_minute: self.per_minute,
                    per_hour: self.per_hour,
                },
            ),
        }
    }
}

/// Validator over a fixed set of keys
#[derive(Debug, Clone, Default)]
pub struct StaticKeyValidator {
    keys: HashMap<String, Credential>,
}

impl StaticKeyValidator {
    pub fn new(entries: &[ApiKeyEntry]) -> Self {
        let keys = entries
            .iter()
            .map(|entry| (entry.key.clone(), entry.credential()))
            .collect();
        Self { keys }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[async_trait]
impl AuthValidator for StaticKeyValidator {
    async fn validate_api_key(&self, token: &str) -> Result<Option<Credential>> {
        let credential = self.keys.get(token).cloned();
        if credential.is_none() {
            debug!("Unknown API key presented");
        }
        Ok(credential)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries() -> Vec<ApiKeyEntry> {
        vec![
            ApiKeyEntry {
                key: "secret-1".to_string(),
                key_id: "ops".to_string(),
                permissions: vec!["read".to_string()],
                per_minute: Some(500),
                per_hour: None,
            },
            ApiKeyEntry {
                key: "secret-2".to_string(),
                key_id: "batch".to_string(),
                permissions: vec![],
                per_minute: None,
                per_hour: Some(10),
            },
        ]
    }

    #[tokio::test]
    async fn test_known_key_yields_credential() {
        let validator = StaticKeyValidator::new(&entries());
        let credential = validator.validate_api_key("secret-1").await.unwrap().unwrap();
        assert_eq!(credential.key_id, "ops");
        assert!(credential.has_permission("read"));
        assert_eq!(
            credential.rate_limit,
            Some(RateLimitHint {
                per_minute: Some(500),
                per_hour: None
            })
        );
    }

    #[tokio::test]
    async fn test_hourly_only_key_keeps_its_quota() {
        let validator = StaticKeyValidator::new(&entries());
        let credential = validator.validate_api_key("secret-2").await.unwrap().unwrap();
        assert_eq!(
            credential.rate_limit,
            Some(RateLimitHint {
                per_minute: None,
                per_hour: Some(10)
            })
        );
    }

    #[tokio::test]
    async fn test_key_without_quotas_has_no_hint() {
        let entry = ApiKeyEntry {
            key: "secret-3".to_string(),
            key_id: "plain".to_string(),
            permissions: vec![],
            per_minute: None,
            per_hour: None,
        };
        let validator = StaticKeyValidator::new(&[entry]);
        let credential = validator.validate_api_key("secret-3").await.unwrap().unwrap();
        assert!(credential.rate_limit.is_none());
    }

    #[tokio::test]
    async fn test_unknown_key() {
        let validator = StaticKeyValidator::new(&entries());
        assert_eq!(validator.len(), 2);
        assert!(validator.validate_api_key("nope").await.unwrap().is_none());
    }
}
