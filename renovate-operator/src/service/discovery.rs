//! Discovery agent service
//!
//! Runs the discovery probe of a renovate job and turns its output into the
//! list of projects the job manages:
//! - Launching the probe under a per-tenant lock
//! - Classifying the latest probe generation
//! - Waiting for the probe and parsing its output

use async_trait::async_trait;
use renovate_core::domain::job::{RenovateJob, RenovateJobIdentifier};
use renovate_core::domain::project::ProjectState;
use renovate_core::domain::workload::{Workload, WorkloadSelector};
use renovate_core::parser::parse_discovered_projects;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{OperatorError, Result};
use crate::locks::KeyedLocks;
use crate::repository::{WorkloadRepository, create_with_generation, find_latest};
use crate::service::templates::WorkloadTemplates;

/// Service trait for project discovery
#[async_trait]
pub trait DiscoveryAgent: Send + Sync {
    /// Launches a probe for `job` and waits for its result
    ///
    /// Returns the discovered project names, sorted.
    async fn discover(&self, job: &RenovateJob) -> Result<Vec<String>>;

    /// Launches the discovery probe of a job
    ///
    /// Concurrent calls for the same job are serialized. Every call starts a
    /// new generation and earlier probes, finished or not, are removed.
    async fn create_discovery_job(&self, job: &RenovateJob) -> Result<Workload>;

    /// State of the latest probe of a job
    ///
    /// A probe that cannot be found after the configured lookups counts as
    /// `Failed`.
    async fn get_discovery_job_status(&self, id: &RenovateJobIdentifier) -> Result<ProjectState>;

    /// Polls the latest probe until it finishes and parses its output
    async fn wait_for_discovery_job(&self, id: &RenovateJobIdentifier) -> Result<Vec<String>>;
}

/// Timing of probe lookups and polls
#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    pub poll_interval: Duration,
    pub lookup_retries: u32,
    pub lookup_delay: Duration,
    pub cleanup_timeout: Duration,
}

impl From<&Config> for DiscoverySettings {
    fn from(config: &Config) -> Self {
        Self {
            poll_interval: config.discovery_poll_interval,
            lookup_retries: config.discovery_lookup_retries,
            lookup_delay: config.discovery_lookup_delay,
            cleanup_timeout: config.cleanup_timeout,
        }
    }
}

/// Standard implementation of DiscoveryAgent
pub struct StandardDiscoveryAgent {
    workloads: Arc<dyn WorkloadRepository>,
    templates: Arc<dyn WorkloadTemplates>,
    settings: DiscoverySettings,
    locks: KeyedLocks,
    shutdown: CancellationToken,
}

impl StandardDiscoveryAgent {
    /// Creates a new discovery agent
    ///
    /// # Arguments
    /// * `workloads` - Store the probes are launched in
    /// * `templates` - Builds the probe specification
    /// * `settings` - Poll and lookup timing
    /// * `shutdown` - Interrupts waiting for a probe
    pub fn new(
        workloads: Arc<dyn WorkloadRepository>,
        templates: Arc<dyn WorkloadTemplates>,
        settings: DiscoverySettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            workloads,
            templates,
            settings,
            locks: KeyedLocks::new(),
            shutdown,
        }
    }
}

#[async_trait]
impl DiscoveryAgent for StandardDiscoveryAgent {
    async fn discover(&self, job: &RenovateJob) -> Result<Vec<String>> {
        self.create_discovery_job(job).await?;
        self.wait_for_discovery_job(&job.identifier()).await
    }

    async fn create_discovery_job(&self, job: &RenovateJob) -> Result<Workload> {
        let id = job.identifier();
        let _guard = self.locks.lock(&id.fullname()).await;

        let selector = WorkloadSelector::discovery(&id);
        let spec = self.templates.discovery(job)?;
        let probe =
            create_with_generation(&self.workloads, &selector, spec, self.settings.cleanup_timeout)
                .await?;

        info!(tenant = %id, "Started discovery probe {}", probe.name);
        Ok(probe)
    }

    async fn get_discovery_job_status(&self, id: &RenovateJobIdentifier) -> Result<ProjectState> {
        let selector = WorkloadSelector::discovery(id);

        for attempt in 1..=self.settings.lookup_retries {
            match find_latest(self.workloads.as_ref(), &selector).await {
                Ok(probe) => return Ok(probe.probe_state()),
                Err(e) if e.is_not_found() => {
                    debug!(
                        tenant = %id,
                        "Discovery probe not found yet (attempt {}/{})",
                        attempt, self.settings.lookup_retries
                    );
                    if attempt < self.settings.lookup_retries {
                        time::sleep(self.settings.lookup_delay).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        warn!(tenant = %id, "Discovery probe not found, treating it as failed");
        Ok(ProjectState::Failed)
    }

    async fn wait_for_discovery_job(&self, id: &RenovateJobIdentifier) -> Result<Vec<String>> {
        loop {
            match self.get_discovery_job_status(id).await? {
                ProjectState::Completed => break,
                ProjectState::Failed => {
                    return Err(OperatorError::Discovery(format!(
                        "discovery probe of {} failed",
                        id
                    )));
                }
                ProjectState::Running | ProjectState::Scheduled => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Err(OperatorError::Cancelled),
                        _ = time::sleep(self.settings.poll_interval) => {}
                    }
                }
            }
        }

        let selector = WorkloadSelector::discovery(id);
        let probe = find_latest(self.workloads.as_ref(), &selector).await?;
        let output = self.workloads.logs(&probe).await?;

        let mut projects = parse_discovered_projects(&output)?;
        projects.sort();

        info!(tenant = %id, "Discovered {} project(s)", projects.len());
        Ok(projects)
    }
}
