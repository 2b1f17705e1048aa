//! Job manager service
//!
//! Owns every read and write of the renovate job status. Writes follow
//! read-modify-write with retry on conflict, and one process-wide lock
//! serializes writers: reads share it, mutations hold it exclusively for the
//! whole retry loop. Across processes only the store's version check orders
//! writes.

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use renovate_core::domain::job::{RenovateJob, RenovateJobIdentifier};
use renovate_core::domain::project::{ProjectState, ProjectStatus, StatusUpdate};
use renovate_core::domain::workload::WorkloadSelector;
use renovate_core::status::apply_transition;
use sha2::Sha256;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{OperatorError, Result};
use crate::repository::{SecretRepository, TenantRepository, WorkloadRepository, find_latest};
use crate::retry::{RetryPolicy, retry_on_conflict};
use crate::service::metrics::MetricsSink;

type HmacSha256 = Hmac<Sha256>;

/// Predicate selecting projects for a batched update
pub type ProjectFilter = dyn Fn(&ProjectStatus) -> bool + Send + Sync;

/// Service trait for renovate job state
#[async_trait]
pub trait JobManager: Send + Sync {
    /// Fetches the current job
    async fn get(&self, id: &RenovateJobIdentifier) -> Result<RenovateJob>;

    /// Lists the identities of all jobs
    async fn list_identifiers(&self) -> Result<Vec<RenovateJobIdentifier>>;

    /// Lists all jobs with their state
    async fn list_full(&self) -> Result<Vec<RenovateJob>>;

    /// All project records of a job, in discovery order
    async fn get_projects(&self, id: &RenovateJobIdentifier) -> Result<Vec<ProjectStatus>>;

    /// Project records of a job in the given state
    async fn get_projects_by_status(
        &self,
        id: &RenovateJobIdentifier,
        status: ProjectState,
    ) -> Result<Vec<ProjectStatus>>;

    /// Replaces the project set of a job with a fresh discovery result
    ///
    /// Known projects keep their record, new ones start `Scheduled`, vanished
    /// ones are dropped together with their metrics.
    ///
    /// # Arguments
    /// * `id` - The job
    /// * `discovered` - Project names in discovery order
    async fn reconcile_projects(&self, id: &RenovateJobIdentifier, discovered: &[String])
    -> Result<()>;

    /// Applies a transition to one project
    ///
    /// A `Scheduled` request for an unknown project adds it; any other
    /// request for an unknown project is `NotFound`.
    ///
    /// # Arguments
    /// * `id` - The job
    /// * `project` - Project name
    /// * `update` - Requested status and payload
    async fn update_status(
        &self,
        id: &RenovateJobIdentifier,
        project: &str,
        update: StatusUpdate,
    ) -> Result<()>;

    /// Applies a transition to every project matching `filter`
    async fn update_status_batched(
        &self,
        id: &RenovateJobIdentifier,
        filter: &ProjectFilter,
        update: StatusUpdate,
    ) -> Result<()>;

    /// Output of the most recent run of a project
    async fn get_logs_for_project(&self, id: &RenovateJobIdentifier, project: &str)
    -> Result<String>;

    /// Checks a webhook token against the job's credentials
    ///
    /// `false` when webhook authentication is not enabled for the job.
    async fn is_token_valid(&self, id: &RenovateJobIdentifier, token: &str) -> Result<bool>;

    /// Checks an `sha256=<hex>` HMAC signature of `body` against the job's credentials
    ///
    /// `false` when webhook authentication is not enabled for the job.
    async fn is_signature_valid(
        &self,
        id: &RenovateJobIdentifier,
        signature: &str,
        body: &[u8],
    ) -> Result<bool>;
}

/// Standard implementation of JobManager
pub struct StandardJobManager {
    tenants: Arc<dyn TenantRepository>,
    workloads: Arc<dyn WorkloadRepository>,
    secrets: Arc<dyn SecretRepository>,
    metrics: Arc<dyn MetricsSink>,
    lock: RwLock<()>,
    retry: RetryPolicy,
}

impl StandardJobManager {
    /// Creates a new job manager
    ///
    /// # Arguments
    /// * `tenants` - Store of the renovate job resources
    /// * `workloads` - Store of the execution workloads, for log lookups
    /// * `secrets` - Credential store for webhook checks
    /// * `metrics` - Notified when projects disappear
    pub fn new(
        tenants: Arc<dyn TenantRepository>,
        workloads: Arc<dyn WorkloadRepository>,
        secrets: Arc<dyn SecretRepository>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            tenants,
            workloads,
            secrets,
            metrics,
            lock: RwLock::new(()),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Read, mutate and write a job under the write lock, retrying conflicts
    ///
    /// `mutation` may run several times; its result of the successful
    /// attempt is returned.
    async fn mutate<T, F>(&self, id: &RenovateJobIdentifier, mutation: F) -> Result<T>
    where
        T: Send,
        F: Fn(&mut RenovateJob) -> Result<T> + Send + Sync,
    {
        let _guard = self.lock.write().await;
        let tenants = &self.tenants;
        let mutation = &mutation;

        retry_on_conflict(&self.retry, move || async move {
            let mut job = tenants.get(id).await?;
            let value = mutation(&mut job)?;
            tenants.update_status(&job).await?;
            Ok(value)
        })
        .await
    }

    /// Credentials accepted for webhooks, `None` when authentication is off
    async fn webhook_tokens(&self, id: &RenovateJobIdentifier) -> Result<Option<Vec<String>>> {
        let job = self.tenants.get(id).await?;

        let Some(auth) = job.webhook_authentication() else {
            return Ok(None);
        };
        let secret_ref = auth.secret_ref.as_ref().ok_or_else(|| {
            OperatorError::InvalidRequest(format!(
                "webhook authentication of {} has no secret reference",
                id
            ))
        })?;

        let raw = self
            .secrets
            .get_value(job.namespace(), &secret_ref.name, &secret_ref.key)
            .await?;

        Ok(Some(split_tokens(&raw)))
    }
}

#[async_trait]
impl JobManager for StandardJobManager {
    async fn get(&self, id: &RenovateJobIdentifier) -> Result<RenovateJob> {
        let _guard = self.lock.read().await;
        self.tenants.get(id).await
    }

    async fn list_identifiers(&self) -> Result<Vec<RenovateJobIdentifier>> {
        let _guard = self.lock.read().await;
        Ok(self
            .tenants
            .list()
            .await?
            .iter()
            .map(RenovateJob::identifier)
            .collect())
    }

    async fn list_full(&self) -> Result<Vec<RenovateJob>> {
        let _guard = self.lock.read().await;
        self.tenants.list().await
    }

    async fn get_projects(&self, id: &RenovateJobIdentifier) -> Result<Vec<ProjectStatus>> {
        let _guard = self.lock.read().await;
        Ok(self.tenants.get(id).await?.status.projects)
    }

    async fn get_projects_by_status(
        &self,
        id: &RenovateJobIdentifier,
        status: ProjectState,
    ) -> Result<Vec<ProjectStatus>> {
        let _guard = self.lock.read().await;
        let job = self.tenants.get(id).await?;
        Ok(job
            .status
            .projects
            .into_iter()
            .filter(|p| p.status == status)
            .collect())
    }

    async fn reconcile_projects(
        &self,
        id: &RenovateJobIdentifier,
        discovered: &[String],
    ) -> Result<()> {
        let removed = self
            .mutate(id, |job| {
                let wanted: HashSet<&str> = discovered.iter().map(String::as_str).collect();
                let mut known = std::mem::take(&mut job.status.projects);

                let removed: Vec<String> = known
                    .iter()
                    .filter(|p| !wanted.contains(p.name.as_str()))
                    .map(|p| p.name.clone())
                    .collect();

                let mut seen = HashSet::new();
                job.status.projects = discovered
                    .iter()
                    .filter(|name| seen.insert(name.as_str()))
                    .map(|name| match known.iter().position(|p| &p.name == name) {
                        Some(index) => known.swap_remove(index),
                        None => ProjectStatus::scheduled(name.as_str()),
                    })
                    .collect();

                Ok(removed)
            })
            .await?;

        // only the successful attempt reports removals
        for project in &removed {
            self.metrics
                .delete_project_metrics(&id.namespace, &id.name, project);
        }

        info!(
            tenant = %id,
            "Reconciled {} project(s), removed {}",
            discovered.len(),
            removed.len()
        );
        Ok(())
    }

    async fn update_status(
        &self,
        id: &RenovateJobIdentifier,
        project: &str,
        update: StatusUpdate,
    ) -> Result<()> {
        self.mutate(id, |job| {
            let now = Utc::now();
            let projects = &mut job.status.projects;

            match projects.iter().position(|p| p.name == project) {
                Some(index) => {
                    let current = projects[index].clone();
                    projects[index] = apply_transition(current, &update, now);
                }
                None if update.status == ProjectState::Scheduled => {
                    projects.push(apply_transition(ProjectStatus::scheduled(project), &update, now));
                }
                None => {
                    return Err(OperatorError::not_found(format!(
                        "project {} in renovate job {}",
                        project, id
                    )));
                }
            }
            Ok(())
        })
        .await?;

        debug!(tenant = %id, project = %project, "Requested status {}", update.status);
        Ok(())
    }

    async fn update_status_batched(
        &self,
        id: &RenovateJobIdentifier,
        filter: &ProjectFilter,
        update: StatusUpdate,
    ) -> Result<()> {
        let matched = self
            .mutate(id, |job| {
                let now = Utc::now();
                let mut matched = 0;
                for project in job.status.projects.iter_mut() {
                    if filter(project) {
                        *project = apply_transition(project.clone(), &update, now);
                        matched += 1;
                    }
                }
                Ok(matched)
            })
            .await?;

        debug!(tenant = %id, "Requested status {} for {} project(s)", update.status, matched);
        Ok(())
    }

    async fn get_logs_for_project(
        &self,
        id: &RenovateJobIdentifier,
        project: &str,
    ) -> Result<String> {
        let _guard = self.lock.read().await;
        let job = self.tenants.get(id).await?;

        let selector = WorkloadSelector::executor(&job.identifier(), project);
        let workload = find_latest(self.workloads.as_ref(), &selector).await?;

        self.workloads.logs(&workload).await
    }

    async fn is_token_valid(&self, id: &RenovateJobIdentifier, token: &str) -> Result<bool> {
        let _guard = self.lock.read().await;

        let Some(tokens) = self.webhook_tokens(id).await? else {
            return Ok(false);
        };

        Ok(tokens.iter().any(|t| t == token))
    }

    async fn is_signature_valid(
        &self,
        id: &RenovateJobIdentifier,
        signature: &str,
        body: &[u8],
    ) -> Result<bool> {
        let _guard = self.lock.read().await;

        let Some(tokens) = self.webhook_tokens(id).await? else {
            return Ok(false);
        };

        Ok(tokens
            .iter()
            .any(|secret| signature_matches(secret, signature, body)))
    }
}

// =============================================================================
// Webhook credentials
// =============================================================================

/// Splits a comma separated credential list, ignoring blanks
fn split_tokens(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}

/// Constant time check of an `sha256=<hex>` HMAC signature
fn signature_matches(secret: &str, signature: &str, body: &[u8]) -> bool {
    let Some(hex_signature) = signature.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(provided) = hex::decode(hex_signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };

    mac.update(body);
    mac.verify_slice(&provided).is_ok()
}
