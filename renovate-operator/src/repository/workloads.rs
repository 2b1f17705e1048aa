//! Workload repository
//!
//! Lifecycle of execution workloads in the remote store:
//! - Creating workloads from a fully formed specification
//! - Listing workloads by label
//! - Deleting workloads
//! - Fetching the output of a workload's most recent run
//!
//! Generation handling lives here as well: a new workload for a logical name
//! is created first and superseded generations are removed afterwards by a
//! best-effort background task.

use async_trait::async_trait;
use chrono::Utc;
use renovate_core::domain::workload::{
    JobType, LABEL_GENERATION, LABEL_JOB_TYPE, Workload, WorkloadSelector, WorkloadSpec, WorkloadStatus,
    latest_generation,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{OperatorError, Result};

/// Repository trait for execution workloads
#[async_trait]
pub trait WorkloadRepository: Send + Sync {
    /// Creates a workload
    ///
    /// The store derives the final name from `spec.generate_name`.
    async fn create(&self, spec: WorkloadSpec) -> Result<Workload>;

    /// Lists the workloads of a namespace carrying all of the given labels
    ///
    /// # Arguments
    /// * `namespace` - Namespace to search
    /// * `labels` - Labels every returned workload must carry
    async fn list(&self, namespace: &str, labels: &BTreeMap<String, String>)
    -> Result<Vec<Workload>>;

    /// Deletes a workload
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;

    /// Fetches the output of the most recent run of a workload
    async fn logs(&self, workload: &Workload) -> Result<String>;
}

/// Returns the most recent generation of the workloads matching `selector`
pub async fn find_latest(
    repo: &dyn WorkloadRepository,
    selector: &WorkloadSelector,
) -> Result<Workload> {
    let workloads = repo.list(&selector.namespace, &selector.labels()).await?;

    latest_generation(workloads).ok_or_else(|| {
        OperatorError::not_found(format!(
            "{} workload {}",
            selector.job_type.as_str(),
            selector.job_name
        ))
    })
}

/// Creates a generation stamped workload and removes older generations in
/// the background
///
/// # Arguments
/// * `repo` - Workload store
/// * `selector` - Logical identity of the workload
/// * `spec` - Workload specification from the template builder
/// * `cleanup_timeout` - Upper bound for the background cleanup
pub async fn create_with_generation(
    repo: &Arc<dyn WorkloadRepository>,
    selector: &WorkloadSelector,
    mut spec: WorkloadSpec,
    cleanup_timeout: Duration,
) -> Result<Workload> {
    let generation = Utc::now().timestamp().to_string();

    spec.labels.extend(selector.labels());
    spec.labels
        .insert(LABEL_GENERATION.to_string(), generation.clone());

    let created = repo.create(spec).await?;
    debug!(
        "Created workload {} (generation {}) for {}",
        created.name, generation, selector.job_name
    );

    let repo = Arc::clone(repo);
    let selector = selector.clone();
    tokio::spawn(async move {
        let cleanup = cleanup_old_generations(repo.as_ref(), &selector, &generation);
        match tokio::time::timeout(cleanup_timeout, cleanup).await {
            Ok(Ok(0)) => {}
            Ok(Ok(removed)) => debug!(
                "Removed {} superseded workload(s) for {}",
                removed, selector.job_name
            ),
            Ok(Err(e)) => warn!(
                "Failed to clean up old generations of {}: {}",
                selector.job_name, e
            ),
            Err(_) => warn!(
                "Cleanup of old generations of {} timed out after {:?}",
                selector.job_name, cleanup_timeout
            ),
        }
    });

    Ok(created)
}

/// Deletes every workload of `selector` that is not of generation `current`
async fn cleanup_old_generations(
    repo: &dyn WorkloadRepository,
    selector: &WorkloadSelector,
    current: &str,
) -> Result<usize> {
    let workloads = repo.list(&selector.namespace, &selector.labels()).await?;
    let mut removed = 0;

    for workload in workloads {
        if workload.labels.get(LABEL_GENERATION).map(String::as_str) == Some(current) {
            continue;
        }

        match repo.delete(&workload.namespace, &workload.name).await {
            Ok(()) => removed += 1,
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!("Failed to delete workload {}: {}", workload.name, e),
        }
    }

    Ok(removed)
}

// =============================================================================
// In-memory store
// =============================================================================

/// Outcome applied to every new workload of a job type
///
/// Stands in for the platform actually running the workload.
#[derive(Debug, Clone, Default)]
pub struct ScriptedRun {
    pub status: WorkloadStatus,
    pub logs: String,
}

type WorkloadKey = (String, String);

/// In-memory implementation of WorkloadRepository
#[derive(Default)]
pub struct InMemoryWorkloadRepository {
    workloads: RwLock<BTreeMap<WorkloadKey, Workload>>,
    logs: RwLock<HashMap<WorkloadKey, String>>,
    scripts: RwLock<HashMap<JobType, ScriptedRun>>,
}

impl InMemoryWorkloadRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every workload of `job_type` created from now on finish with `run`
    pub async fn script(&self, job_type: JobType, run: ScriptedRun) {
        self.scripts.write().await.insert(job_type, run);
    }

    /// All stored workloads
    pub async fn workloads(&self) -> Vec<Workload> {
        self.workloads.read().await.values().cloned().collect()
    }

    /// Replaces the store-driven status of a workload
    pub async fn set_status(&self, namespace: &str, name: &str, status: WorkloadStatus) -> Result<()> {
        let mut workloads = self.workloads.write().await;
        let workload = workloads
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| OperatorError::not_found(format!("workload {}/{}", namespace, name)))?;
        workload.status = status;
        Ok(())
    }

    /// Sets the output of a workload
    pub async fn set_logs(&self, namespace: &str, name: &str, logs: impl Into<String>) {
        self.logs
            .write()
            .await
            .insert((namespace.to_string(), name.to_string()), logs.into());
    }
}

#[async_trait]
impl WorkloadRepository for InMemoryWorkloadRepository {
    async fn create(&self, spec: WorkloadSpec) -> Result<Workload> {
        let suffix = Uuid::new_v4().simple().to_string();
        let name = format!("{}{}", spec.generate_name, &suffix[..5]);
        let now = Utc::now();

        let job_type = spec
            .labels
            .get(LABEL_JOB_TYPE)
            .and_then(|t| JobType::from_label(t));
        let scripted = match job_type {
            Some(job_type) => self.scripts.read().await.get(&job_type).cloned(),
            None => None,
        };

        let mut workload = Workload {
            name: name.clone(),
            namespace: spec.namespace.clone(),
            labels: spec.labels.clone(),
            created_at: now,
            spec,
            status: WorkloadStatus {
                start_time: Some(now),
                ..Default::default()
            },
        };

        let key = (workload.namespace.clone(), name);
        if let Some(run) = scripted {
            workload.status = WorkloadStatus {
                start_time: run.status.start_time.or(Some(now)),
                ..run.status
            };
            self.logs.write().await.insert(key.clone(), run.logs);
        }

        self.workloads.write().await.insert(key, workload.clone());
        Ok(workload)
    }

    async fn list(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Workload>> {
        Ok(self
            .workloads
            .read()
            .await
            .values()
            .filter(|w| w.namespace == namespace)
            .filter(|w| labels.iter().all(|(k, v)| w.labels.get(k) == Some(v)))
            .cloned()
            .collect())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        let key = (namespace.to_string(), name.to_string());
        self.logs.write().await.remove(&key);
        self.workloads
            .write()
            .await
            .remove(&key)
            .map(|_| ())
            .ok_or_else(|| OperatorError::not_found(format!("workload {}/{}", namespace, name)))
    }

    async fn logs(&self, workload: &Workload) -> Result<String> {
        self.logs
            .read()
            .await
            .get(&(workload.namespace.clone(), workload.name.clone()))
            .cloned()
            .ok_or_else(|| OperatorError::not_found(format!("no pods found for workload {}", workload.name)))
    }
}
