//! Tenant reconciler
//!
//! Keeps one cron schedule per renovate job. Every change notification and
//! every periodic resync installs, updates or removes the schedule of a job.
//! On each occurrence the schedule discovers the job's projects and queues
//! every project that is not running.

use renovate_core::domain::job::RenovateJobIdentifier;
use renovate_core::domain::project::{ProjectState, ProjectStatus};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::repository::TenantRepository;
use crate::scheduler::{ScheduleCallback, Scheduler, schedule_callback};
use crate::service::{DiscoveryAgent, JobManager};

pub struct Reconciler {
    tenants: Arc<dyn TenantRepository>,
    manager: Arc<dyn JobManager>,
    discovery: Arc<dyn DiscoveryAgent>,
    scheduler: Arc<Scheduler>,
    resync_interval: Duration,
}

impl Reconciler {
    pub fn new(
        tenants: Arc<dyn TenantRepository>,
        manager: Arc<dyn JobManager>,
        discovery: Arc<dyn DiscoveryAgent>,
        scheduler: Arc<Scheduler>,
        resync_interval: Duration,
    ) -> Self {
        Self {
            tenants,
            manager,
            discovery,
            scheduler,
            resync_interval,
        }
    }

    /// Brings the schedule of one job in line with the job
    ///
    /// A job that no longer exists loses its schedule.
    pub async fn reconcile(&self, id: &RenovateJobIdentifier) -> Result<()> {
        let job = match self.tenants.get(id).await {
            Ok(job) => job,
            Err(e) if e.is_not_found() => {
                debug!(tenant = %id, "Renovate job gone, removing its schedule");
                self.scheduler.remove_schedule(&id.fullname());
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        self.scheduler.add_schedule_replace_existing(
            &id.fullname(),
            &job.spec.schedule,
            self.discovery_callback(id.clone()),
        )
    }

    /// Reconciles every job and drops schedules of jobs that disappeared
    pub async fn resync(&self) -> Result<()> {
        let jobs = self.tenants.list().await?;
        let known: HashSet<String> = jobs.iter().map(|j| j.fullname()).collect();

        for job in &jobs {
            let id = job.identifier();
            if let Err(e) = self.reconcile(&id).await {
                error!(tenant = %id, "Failed to reconcile: {}", e);
            }
        }

        for name in self.scheduler.names() {
            if !known.contains(&name) {
                self.scheduler.remove_schedule(&name);
            }
        }

        debug!("Resynced {} renovate job(s)", jobs.len());
        Ok(())
    }

    /// Spawns the reconcile loop; it ends once `token` is cancelled
    pub fn start(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "Starting reconciler (resync interval: {:?})",
                self.resync_interval
            );

            let mut events = self.tenants.watch();
            let mut events_open = true;
            let mut resync = time::interval(self.resync_interval);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = resync.tick() => {
                        if let Err(e) = self.resync().await {
                            error!("Resync failed: {}", e);
                        }
                    }
                    event = events.recv(), if events_open => match event {
                        Ok(event) => {
                            let id = event.identifier();
                            if let Err(e) = self.reconcile(id).await {
                                error!(tenant = %id, "Failed to reconcile: {}", e);
                            }
                        }
                        Err(RecvError::Lagged(missed)) => {
                            warn!("Missed {} renovate job event(s), resyncing", missed);
                            if let Err(e) = self.resync().await {
                                error!("Resync failed: {}", e);
                            }
                        }
                        Err(RecvError::Closed) => {
                            warn!("Renovate job events closed, relying on resync");
                            events_open = false;
                        }
                    },
                }
            }

            info!("Reconciler stopped");
        })
    }

    fn discovery_callback(&self, id: RenovateJobIdentifier) -> ScheduleCallback {
        let manager = Arc::clone(&self.manager);
        let discovery = Arc::clone(&self.discovery);

        schedule_callback(move || {
            let manager = Arc::clone(&manager);
            let discovery = Arc::clone(&discovery);
            let id = id.clone();
            async move {
                if let Err(e) = run_discovery(manager.as_ref(), discovery.as_ref(), &id).await {
                    error!(tenant = %id, "Scheduled discovery failed: {}", e);
                }
            }
        })
    }
}

/// Discovers the projects of a job and queues everything not running
pub async fn run_discovery(
    manager: &dyn JobManager,
    discovery: &dyn DiscoveryAgent,
    id: &RenovateJobIdentifier,
) -> Result<()> {
    let job = manager.get(id).await?;
    let projects = discovery.discover(&job).await?;

    manager.reconcile_projects(id, &projects).await?;
    manager
        .update_status_batched(
            id,
            &|p: &ProjectStatus| p.status != ProjectState::Running,
            ProjectState::Scheduled.into(),
        )
        .await?;

    info!(tenant = %id, "Queued {} project(s)", projects.len());
    Ok(())
}
