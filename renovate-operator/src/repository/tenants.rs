//! Tenant repository
//!
//! Access to the renovate job resources kept by the remote store:
//! - Reading and listing jobs
//! - Writing the status subresource under optimistic concurrency
//! - Applying desired state and deleting jobs (external actors)
//! - Watching for changes

use async_trait::async_trait;
use renovate_core::domain::job::{RenovateJob, RenovateJobIdentifier};
use std::collections::BTreeMap;
use tokio::sync::{RwLock, broadcast};
use tracing::debug;

use crate::error::{OperatorError, Result};

/// Change notification for a renovate job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TenantEvent {
    Applied(RenovateJobIdentifier),
    Deleted(RenovateJobIdentifier),
}

impl TenantEvent {
    pub fn identifier(&self) -> &RenovateJobIdentifier {
        match self {
            TenantEvent::Applied(id) | TenantEvent::Deleted(id) => id,
        }
    }
}

/// Repository trait for renovate job resources
#[async_trait]
pub trait TenantRepository: Send + Sync {
    /// Fetches a job by identity
    ///
    /// # Arguments
    /// * `id` - Name and namespace of the job
    async fn get(&self, id: &RenovateJobIdentifier) -> Result<RenovateJob>;

    /// Lists all jobs
    async fn list(&self) -> Result<Vec<RenovateJob>>;

    /// Writes the status of a job
    ///
    /// Fails with `Conflict` when `job.metadata.resource_version` is not the
    /// stored version. Returns the job with its new version.
    ///
    /// # Arguments
    /// * `job` - The job as read, with a modified status
    async fn update_status(&self, job: &RenovateJob) -> Result<RenovateJob>;

    /// Creates a job or replaces its desired state, keeping the stored status
    async fn apply(&self, job: RenovateJob) -> Result<RenovateJob>;

    /// Deletes a job
    async fn delete(&self, id: &RenovateJobIdentifier) -> Result<()>;

    /// Subscribes to change notifications
    fn watch(&self) -> broadcast::Receiver<TenantEvent>;
}

/// In-memory implementation of TenantRepository
pub struct InMemoryTenantRepository {
    jobs: RwLock<BTreeMap<RenovateJobIdentifier, RenovateJob>>,
    events: broadcast::Sender<TenantEvent>,
}

impl InMemoryTenantRepository {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            jobs: RwLock::new(BTreeMap::new()),
            events,
        }
    }

    fn notify(&self, event: TenantEvent) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }
}

impl Default for InMemoryTenantRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TenantRepository for InMemoryTenantRepository {
    async fn get(&self, id: &RenovateJobIdentifier) -> Result<RenovateJob> {
        self.jobs
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| OperatorError::not_found(format!("renovate job {}", id)))
    }

    async fn list(&self) -> Result<Vec<RenovateJob>> {
        Ok(self.jobs.read().await.values().cloned().collect())
    }

    async fn update_status(&self, job: &RenovateJob) -> Result<RenovateJob> {
        let id = job.identifier();
        let mut jobs = self.jobs.write().await;

        let stored = jobs
            .get_mut(&id)
            .ok_or_else(|| OperatorError::not_found(format!("renovate job {}", id)))?;

        if stored.metadata.resource_version != job.metadata.resource_version {
            debug!(
                "Stale status write for {} (have {}, got {})",
                id, stored.metadata.resource_version, job.metadata.resource_version
            );
            return Err(OperatorError::Conflict(format!("renovate job {}", id)));
        }

        stored.status = job.status.clone();
        stored.metadata.resource_version += 1;

        Ok(stored.clone())
    }

    async fn apply(&self, mut job: RenovateJob) -> Result<RenovateJob> {
        let id = job.identifier();
        let applied = {
            let mut jobs = self.jobs.write().await;
            match jobs.get(&id) {
                Some(stored) => {
                    job.status = stored.status.clone();
                    job.metadata.resource_version = stored.metadata.resource_version + 1;
                }
                None => job.metadata.resource_version = 1,
            }
            jobs.insert(id.clone(), job.clone());
            job
        };

        self.notify(TenantEvent::Applied(id));
        Ok(applied)
    }

    async fn delete(&self, id: &RenovateJobIdentifier) -> Result<()> {
        let removed = self.jobs.write().await.remove(id);
        if removed.is_none() {
            return Err(OperatorError::not_found(format!("renovate job {}", id)));
        }

        self.notify(TenantEvent::Deleted(id.clone()));
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<TenantEvent> {
        self.events.subscribe()
    }
}
