//! Inbound operations
//!
//! Everything a dashboard or webhook receiver may ask of the operator:
//! triggering single runs, starting and polling discovery, listing tenants,
//! fetching run output and deciding whether a webhook call is trusted.

use chrono::{DateTime, Utc};
use renovate_core::domain::job::RenovateJobIdentifier;
use renovate_core::domain::project::{ProjectState, ProjectStatus};
use renovate_core::domain::workload::WorkloadSelector;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::{OperatorError, Result};
use crate::repository::{WorkloadRepository, find_latest};
use crate::scheduler::next_run;
use crate::service::discovery::DiscoveryAgent;
use crate::service::job_manager::JobManager;

/// A tenant as shown by the dashboard
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantOverview {
    pub name: String,
    pub namespace: String,
    pub schedule: String,
    pub next_run: Option<DateTime<Utc>>,
    pub discovery_status: ProjectState,
    pub projects: Vec<ProjectStatus>,
}

/// Credentials presented by a webhook call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebhookCredentials {
    /// `Authorization` (with or without `Bearer `) or `X-Gitlab-Token`
    pub token: Option<String>,
    /// `X-Hub-Signature-256`
    pub signature: Option<String>,
}

impl WebhookCredentials {
    /// Extracts the credentials from request headers, names compared case-insensitively
    pub fn from_headers<'a>(headers: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut credentials = Self::default();
        let mut gitlab_token = None;

        for (name, value) in headers {
            let value = value.trim();
            if name.eq_ignore_ascii_case("authorization") {
                let token = value.strip_prefix("Bearer ").unwrap_or(value).trim();
                if !token.is_empty() {
                    credentials.token = Some(token.to_string());
                }
            } else if name.eq_ignore_ascii_case("x-gitlab-token") {
                gitlab_token = Some(value.to_string());
            } else if name.eq_ignore_ascii_case("x-hub-signature-256") {
                credentials.signature = Some(value.to_string());
            }
        }

        if credentials.token.is_none() {
            credentials.token = gitlab_token;
        }
        credentials
    }
}

/// Operations exposed to the outer layers
#[derive(Clone)]
pub struct Operations {
    manager: Arc<dyn JobManager>,
    discovery: Arc<dyn DiscoveryAgent>,
    workloads: Arc<dyn WorkloadRepository>,
}

impl Operations {
    pub fn new(
        manager: Arc<dyn JobManager>,
        discovery: Arc<dyn DiscoveryAgent>,
        workloads: Arc<dyn WorkloadRepository>,
    ) -> Self {
        Self {
            manager,
            discovery,
            workloads,
        }
    }

    /// Queues a single project for the next executor pass
    pub async fn trigger_project(&self, id: &RenovateJobIdentifier, project: &str) -> Result<()> {
        self.manager
            .update_status(id, project, ProjectState::Scheduled.into())
            .await?;
        info!(tenant = %id, project = %project, "Project run triggered");
        Ok(())
    }

    /// Launches a discovery probe and reconciles its result in the background
    ///
    /// Refused while a probe of the same tenant is running.
    pub async fn start_discovery(&self, id: &RenovateJobIdentifier) -> Result<()> {
        if self.discovery_status(id).await? == ProjectState::Running {
            return Err(OperatorError::InvalidRequest(format!(
                "discovery of {} is already running",
                id
            )));
        }

        let job = self.manager.get(id).await?;
        self.discovery.create_discovery_job(&job).await?;

        let manager = Arc::clone(&self.manager);
        let discovery = Arc::clone(&self.discovery);
        let id = id.clone();
        tokio::spawn(async move {
            let result = async {
                let projects = discovery.wait_for_discovery_job(&id).await?;
                manager.reconcile_projects(&id, &projects).await
            }
            .await;

            if let Err(e) = result {
                error!(tenant = %id, "Manual discovery failed: {}", e);
            }
        });

        Ok(())
    }

    /// State of the latest discovery probe, `Scheduled` when there is none
    pub async fn discovery_status(&self, id: &RenovateJobIdentifier) -> Result<ProjectState> {
        let selector = WorkloadSelector::discovery(id);
        match find_latest(self.workloads.as_ref(), &selector).await {
            Ok(probe) => Ok(probe.probe_state()),
            Err(e) if e.is_not_found() => Ok(ProjectState::Scheduled),
            Err(e) => Err(e),
        }
    }

    /// All tenants with their live discovery state
    pub async fn list_tenants(&self) -> Result<Vec<TenantOverview>> {
        let jobs = self.manager.list_full().await?;
        let now = Utc::now();
        let mut overviews = Vec::with_capacity(jobs.len());

        for job in jobs {
            let id = job.identifier();
            let discovery_status = match self.discovery_status(&id).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(tenant = %id, "Failed to read discovery status: {}", e);
                    ProjectState::Failed
                }
            };

            overviews.push(TenantOverview {
                next_run: next_run(&job.spec.schedule, now),
                name: job.metadata.name,
                namespace: job.metadata.namespace,
                schedule: job.spec.schedule,
                discovery_status,
                projects: job.status.projects,
            });
        }

        Ok(overviews)
    }

    /// Output of the latest run of a project
    pub async fn project_logs(&self, id: &RenovateJobIdentifier, project: &str) -> Result<String> {
        self.manager.get_logs_for_project(id, project).await
    }

    /// Decides whether a webhook call for a tenant is trusted
    ///
    /// Webhooks must be enabled for the tenant. Without authentication every
    /// call is accepted; otherwise a valid token or signature is required. A
    /// presented token is decisive: when it is rejected the signature is not
    /// consulted.
    ///
    /// # Arguments
    /// * `id` - Tenant addressed by the call
    /// * `credentials` - Token and signature presented by the caller
    /// * `body` - Raw request body, input of the signature
    pub async fn authorize_webhook(
        &self,
        id: &RenovateJobIdentifier,
        credentials: &WebhookCredentials,
        body: &[u8],
    ) -> Result<()> {
        let job = self.manager.get(id).await?;

        if !job.spec.webhook.as_ref().is_some_and(|w| w.enabled) {
            return Err(OperatorError::Unauthorized(format!(
                "webhooks are disabled for {}",
                id
            )));
        }
        if job.webhook_authentication().is_none() {
            return Ok(());
        }

        if let Some(token) = &credentials.token {
            if self.manager.is_token_valid(id, token).await? {
                return Ok(());
            }
            debug!(tenant = %id, "Webhook token rejected");
            return Err(OperatorError::Unauthorized(format!(
                "invalid webhook token for {}",
                id
            )));
        }

        if let Some(signature) = &credentials.signature {
            if self.manager.is_signature_valid(id, signature, body).await? {
                return Ok(());
            }
            debug!(tenant = %id, "Webhook signature rejected");
        }

        Err(OperatorError::Unauthorized(format!(
            "no valid webhook credentials for {}",
            id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::repository::{
        InMemorySecretRepository, InMemoryTenantRepository, InMemoryWorkloadRepository, ScriptedRun,
        Secret, TenantRepository,
    };
    use crate::service::discovery::{DiscoverySettings, StandardDiscoveryAgent};
    use crate::service::job_manager::StandardJobManager;
    use crate::service::metrics::InMemoryMetrics;
    use crate::service::templates::{StandardWorkloadTemplates, TemplateSettings};
    use hmac::{Hmac, Mac};
    use renovate_core::domain::job::{
        RenovateJob, SecretKeyReference, WebhookAuthentication, WebhookSettings,
    };
    use renovate_core::domain::workload::{JobType, WorkloadStatus};
    use sha2::Sha256;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        operations: Operations,
        tenants: Arc<InMemoryTenantRepository>,
        workloads: Arc<InMemoryWorkloadRepository>,
        secrets: Arc<InMemorySecretRepository>,
        manager: Arc<StandardJobManager>,
        id: RenovateJobIdentifier,
    }

    async fn fixture() -> Fixture {
        let tenants = Arc::new(InMemoryTenantRepository::new());
        let workloads = Arc::new(InMemoryWorkloadRepository::new());
        let secrets = Arc::new(InMemorySecretRepository::new());

        let mut job = RenovateJob::new("renovate", "tools", "*/5 * * * *");
        job.spec.image = "renovate/renovate:41".to_string();
        let id = tenants.apply(job).await.unwrap().identifier();

        let manager = Arc::new(StandardJobManager::new(
            tenants.clone(),
            workloads.clone(),
            secrets.clone(),
            Arc::new(InMemoryMetrics::new()),
        ));
        let templates = StandardWorkloadTemplates::new(TemplateSettings::from(&Config::default()));
        let discovery = Arc::new(StandardDiscoveryAgent::new(
            workloads.clone(),
            Arc::new(templates),
            DiscoverySettings {
                poll_interval: Duration::from_secs(1),
                lookup_retries: 2,
                lookup_delay: Duration::from_millis(10),
                cleanup_timeout: Duration::from_secs(5),
            },
            CancellationToken::new(),
        ));

        Fixture {
            operations: Operations::new(manager.clone(), discovery, workloads.clone()),
            tenants,
            workloads,
            secrets,
            manager,
            id,
        }
    }

    #[tokio::test]
    async fn test_trigger_project_schedules_it() {
        let f = fixture().await;
        f.operations.trigger_project(&f.id, "org/a").await.unwrap();

        let projects = f.manager.get_projects(&f.id).await.unwrap();
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].status, ProjectState::Scheduled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_discovery_reconciles_in_background() {
        let f = fixture().await;
        assert_eq!(
            f.operations.discovery_status(&f.id).await.unwrap(),
            ProjectState::Scheduled
        );

        f.operations.start_discovery(&f.id).await.unwrap();
        assert_eq!(
            f.operations.discovery_status(&f.id).await.unwrap(),
            ProjectState::Running
        );
        let err = f.operations.start_discovery(&f.id).await.unwrap_err();
        assert!(matches!(err, OperatorError::InvalidRequest(_)));

        let probe = f.workloads.workloads().await.remove(0);
        f.workloads
            .set_logs("tools", &probe.name, r#"["org/b","org/a"]"#)
            .await;
        f.workloads
            .set_status(
                "tools",
                &probe.name,
                WorkloadStatus {
                    succeeded: 1,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;

        let projects = f.manager.get_projects(&f.id).await.unwrap();
        let names: Vec<&str> = projects.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["org/a", "org/b"]);
        assert_eq!(
            f.operations.discovery_status(&f.id).await.unwrap(),
            ProjectState::Completed
        );
    }

    #[tokio::test]
    async fn test_list_tenants() {
        let f = fixture().await;
        f.workloads
            .script(
                JobType::Discovery,
                ScriptedRun {
                    status: WorkloadStatus {
                        failed: 1,
                        ..Default::default()
                    },
                    logs: String::new(),
                },
            )
            .await;
        let job = f.manager.get(&f.id).await.unwrap();
        f.operations
            .discovery
            .create_discovery_job(&job)
            .await
            .unwrap();

        let tenants = f.operations.list_tenants().await.unwrap();
        assert_eq!(tenants.len(), 1);
        assert_eq!(tenants[0].name, "renovate");
        assert_eq!(tenants[0].schedule, "*/5 * * * *");
        assert!(tenants[0].next_run.is_some());
        assert_eq!(tenants[0].discovery_status, ProjectState::Failed);
    }

    #[test]
    fn test_credentials_from_headers() {
        let credentials = WebhookCredentials::from_headers([
            ("X-Gitlab-Token", "gitlab"),
            ("authorization", "Bearer bearer"),
            ("X-Hub-Signature-256", "sha256=00"),
        ]);
        assert_eq!(credentials.token.as_deref(), Some("bearer"));
        assert_eq!(credentials.signature.as_deref(), Some("sha256=00"));

        let credentials = WebhookCredentials::from_headers([("x-gitlab-token", "gitlab")]);
        assert_eq!(credentials.token.as_deref(), Some("gitlab"));
        assert!(credentials.signature.is_none());

        let credentials = WebhookCredentials::from_headers([
            ("Authorization", "raw-token"),
            ("X-Gitlab-Token", "gitlab"),
        ]);
        assert_eq!(credentials.token.as_deref(), Some("raw-token"));
    }

    async fn configure_webhook(f: &Fixture, enabled: bool, authenticated: bool) {
        let mut job = f.tenants.get(&f.id).await.unwrap();
        job.spec.webhook = Some(WebhookSettings {
            enabled,
            authentication: Some(WebhookAuthentication {
                enabled: authenticated,
                secret_ref: Some(SecretKeyReference {
                    name: "webhook".to_string(),
                    key: "token".to_string(),
                }),
            }),
        });
        f.tenants.apply(job).await.unwrap();
        f.secrets
            .insert(Secret {
                name: "webhook".to_string(),
                namespace: "tools".to_string(),
                data: BTreeMap::from([("token".to_string(), "s3cret".to_string())]),
            })
            .await;
    }

    fn token(value: &str) -> WebhookCredentials {
        WebhookCredentials {
            token: Some(value.to_string()),
            signature: None,
        }
    }

    #[tokio::test]
    async fn test_authorize_webhook() {
        let f = fixture().await;

        let err = f
            .operations
            .authorize_webhook(&f.id, &token("s3cret"), b"")
            .await
            .unwrap_err();
        assert!(matches!(err, OperatorError::Unauthorized(_)));

        configure_webhook(&f, true, false).await;
        f.operations
            .authorize_webhook(&f.id, &WebhookCredentials::default(), b"")
            .await
            .unwrap();

        configure_webhook(&f, true, true).await;
        f.operations
            .authorize_webhook(&f.id, &token("s3cret"), b"")
            .await
            .unwrap();
        assert!(
            f.operations
                .authorize_webhook(&f.id, &token("wrong"), b"")
                .await
                .is_err()
        );
        assert!(
            f.operations
                .authorize_webhook(&f.id, &WebhookCredentials::default(), b"")
                .await
                .is_err()
        );
    }

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[tokio::test]
    async fn test_rejected_token_is_not_rescued_by_signature() {
        let f = fixture().await;
        configure_webhook(&f, true, true).await;
        let body = br#"{"ref":"refs/heads/main"}"#;

        let signed = WebhookCredentials {
            token: None,
            signature: Some(sign("s3cret", body)),
        };
        f.operations
            .authorize_webhook(&f.id, &signed, body)
            .await
            .unwrap();

        let both = WebhookCredentials {
            token: Some("wrong".to_string()),
            signature: Some(sign("s3cret", body)),
        };
        let err = f
            .operations
            .authorize_webhook(&f.id, &both, body)
            .await
            .unwrap_err();
        assert!(matches!(err, OperatorError::Unauthorized(_)));
    }
}
