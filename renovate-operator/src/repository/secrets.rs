//! Secrets repository
//!
//! Read-only access to credential stores referenced by renovate jobs.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use crate::error::{OperatorError, Result};

/// A named set of key/value credentials
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Secret {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

/// Repository trait for credential lookups
#[async_trait]
pub trait SecretRepository: Send + Sync {
    /// Fetches a single value of a secret
    ///
    /// # Arguments
    /// * `namespace` - Namespace of the secret
    /// * `name` - Name of the secret
    /// * `key` - Key inside the secret
    async fn get_value(&self, namespace: &str, name: &str, key: &str) -> Result<String>;
}

/// In-memory implementation of SecretRepository
#[derive(Default)]
pub struct InMemorySecretRepository {
    secrets: RwLock<HashMap<(String, String), BTreeMap<String, String>>>,
}

impl InMemorySecretRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a secret, replacing any previous one with the same name
    pub async fn insert(&self, secret: Secret) {
        self.secrets
            .write()
            .await
            .insert((secret.namespace, secret.name), secret.data);
    }
}

#[async_trait]
impl SecretRepository for InMemorySecretRepository {
    async fn get_value(&self, namespace: &str, name: &str, key: &str) -> Result<String> {
        let secrets = self.secrets.read().await;
        let data = secrets
            .get(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| OperatorError::not_found(format!("secret {}/{}", namespace, name)))?;

        data.get(key).cloned().ok_or_else(|| {
            OperatorError::not_found(format!(
                "secret key {} not found in secret {}/{}",
                key, namespace, name
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_value() {
        let repo = InMemorySecretRepository::new();
        repo.insert(Secret {
            name: "webhook".to_string(),
            namespace: "tools".to_string(),
            data: BTreeMap::from([("tokens".to_string(), "a,b".to_string())]),
        })
        .await;

        assert_eq!(repo.get_value("tools", "webhook", "tokens").await.unwrap(), "a,b");
        assert!(repo.get_value("tools", "webhook", "other").await.unwrap_err().is_not_found());
        assert!(repo.get_value("other", "webhook", "tokens").await.unwrap_err().is_not_found());
    }
}
