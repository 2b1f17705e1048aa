//! Tenants manifest
//!
//! The standalone operator has no control plane to read renovate jobs from.
//! They are declared in a JSON file together with the secrets they reference:
//!
//! ```json
//! { "jobs": [ { "metadata": {...}, "spec": {...} } ], "secrets": [ ... ] }
//! ```

use anyhow::{Context, Result};
use renovate_core::domain::job::RenovateJob;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::repository::{InMemorySecretRepository, Secret, TenantRepository};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TenantManifest {
    #[serde(default)]
    pub jobs: Vec<RenovateJob>,
    #[serde(default)]
    pub secrets: Vec<Secret>,
}

impl TenantManifest {
    /// Reads a manifest file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read tenants manifest {}", path.display()))?;
        Self::parse(&raw)
            .with_context(|| format!("Invalid tenants manifest {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Secret data keyed by namespace and name
    pub fn secret_data(&self) -> HashMap<(String, String), BTreeMap<String, String>> {
        self.secrets
            .iter()
            .map(|s| ((s.namespace.clone(), s.name.clone()), s.data.clone()))
            .collect()
    }

    /// Stores every job and secret of the manifest
    pub async fn seed(
        self,
        tenants: &dyn TenantRepository,
        secrets: &InMemorySecretRepository,
    ) -> Result<usize> {
        for secret in self.secrets {
            secrets.insert(secret).await;
        }

        let count = self.jobs.len();
        for job in self.jobs {
            let id = job.identifier();
            tenants
                .apply(job)
                .await
                .with_context(|| format!("Failed to store renovate job {}", id))?;
        }

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{InMemoryTenantRepository, SecretRepository};

    const MANIFEST: &str = r#"{
        "jobs": [
            {
                "metadata": { "name": "renovate", "namespace": "tools" },
                "spec": {
                    "schedule": "*/5 * * * *",
                    "image": "renovate/renovate:41",
                    "secretRef": "renovate-env",
                    "parallelism": 2
                }
            }
        ],
        "secrets": [
            { "name": "renovate-env", "namespace": "tools", "data": { "RENOVATE_TOKEN": "t" } }
        ]
    }"#;

    #[tokio::test]
    async fn test_seed_from_manifest() {
        let manifest = TenantManifest::parse(MANIFEST).unwrap();
        assert_eq!(manifest.secret_data()[&("tools".to_string(), "renovate-env".to_string())]["RENOVATE_TOKEN"], "t");

        let tenants = InMemoryTenantRepository::new();
        let secrets = InMemorySecretRepository::new();
        assert_eq!(manifest.seed(&tenants, &secrets).await.unwrap(), 1);

        let jobs = tenants.list().await.unwrap();
        assert_eq!(jobs[0].spec.parallelism, 2);
        assert!(jobs[0].status.projects.is_empty());
        assert_eq!(
            secrets
                .get_value("tools", "renovate-env", "RENOVATE_TOKEN")
                .await
                .unwrap(),
            "t"
        );
    }

    #[test]
    fn test_empty_manifest() {
        let manifest = TenantManifest::parse("{}").unwrap();
        assert!(manifest.jobs.is_empty());
        assert!(TenantManifest::parse("[]").is_err());
    }
}
