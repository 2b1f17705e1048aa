//! Executor loop
//!
//! Periodically walks every tenant and drives its projects:
//! - Checks running projects against their workload and records the verdict
//! - Launches scheduled projects while the tenant's parallelism allows
//!
//! A tenant is handled by at most one pass at a time. When a pass is still
//! busy with a tenant the next tick skips it instead of queueing.

use chrono::Utc;
use renovate_core::domain::job::{RenovateJob, RenovateJobIdentifier};
use renovate_core::domain::project::{ProjectState, StatusUpdate};
use renovate_core::domain::workload::{Workload, WorkloadSelector};
use renovate_core::parser::{LogParseResult, parse_renovate_logs};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::health::{HealthCheck, TenantExecutionHealth};
use crate::locks::KeyedLocks;
use crate::repository::{WorkloadRepository, create_with_generation, find_latest};
use crate::service::{JobManager, MetricsSink, WorkloadTemplates};

/// Executor timing and cleanup policy
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub interval: Duration,
    pub delete_successful_jobs: bool,
    pub cleanup_timeout: Duration,
}

impl From<&Config> for ExecutorSettings {
    fn from(config: &Config) -> Self {
        Self {
            interval: config.executor_interval,
            delete_successful_jobs: config.delete_successful_jobs,
            cleanup_timeout: config.cleanup_timeout,
        }
    }
}

/// Launches and supervises project runs
pub struct Executor {
    manager: Arc<dyn JobManager>,
    workloads: Arc<dyn WorkloadRepository>,
    templates: Arc<dyn WorkloadTemplates>,
    metrics: Arc<dyn MetricsSink>,
    health: HealthCheck,
    settings: ExecutorSettings,
    locks: KeyedLocks,
}

impl Executor {
    pub fn new(
        manager: Arc<dyn JobManager>,
        workloads: Arc<dyn WorkloadRepository>,
        templates: Arc<dyn WorkloadTemplates>,
        metrics: Arc<dyn MetricsSink>,
        health: HealthCheck,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            manager,
            workloads,
            templates,
            metrics,
            health,
            settings,
            locks: KeyedLocks::new(),
        }
    }

    /// Spawns the executor loop; it ends once `token` is cancelled
    ///
    /// A pass that is underway when cancellation arrives is not interrupted.
    pub fn start(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "Starting executor (interval: {:?})",
                self.settings.interval
            );
            self.health.update_executor(|h| h.running = true);

            let mut interval = time::interval(self.settings.interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                }

                debug!("Executor tick");
                self.execute_once().await;
            }

            self.health.update_executor(|h| h.running = false);
            info!("Executor stopped");
        })
    }

    /// Starts one pass per tenant that is not already being handled
    ///
    /// Returns the handles of the started passes.
    pub async fn execute_once(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let tenants = match self.manager.list_identifiers().await {
            Ok(tenants) => tenants,
            Err(e) => {
                error!("Failed to list renovate jobs: {}", e);
                return Vec::new();
            }
        };

        let mut handles = Vec::with_capacity(tenants.len());
        for id in tenants {
            let fullname = id.fullname();
            let Some(guard) = self.locks.try_lock(&fullname) else {
                debug!(tenant = %id, "Previous pass still running, skipping");
                continue;
            };

            let executor = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                executor.set_tenant_running(&fullname, true);
                if let Err(e) = executor.execute_tenant(&id).await {
                    error!(tenant = %id, "Execution pass failed: {}", e);
                }
                executor.set_tenant_running(&fullname, false);
                drop(guard);
            }));
        }

        handles
    }

    /// One pass over the projects of a tenant
    ///
    /// The first failing project ends the pass.
    async fn execute_tenant(&self, id: &RenovateJobIdentifier) -> Result<()> {
        let job = self.manager.get(id).await?;
        let parallelism = job.spec.parallelism as usize;
        let mut running = job.running_count();

        for project in &job.status.projects {
            match project.status {
                ProjectState::Completed | ProjectState::Failed => {}
                ProjectState::Running => {
                    if self.check_running(&job, &project.name).await? {
                        running = running.saturating_sub(1);
                    }
                }
                ProjectState::Scheduled => {
                    if running < parallelism {
                        self.launch(&job, &project.name).await?;
                        running += 1;
                    }
                }
            }
        }

        Ok(())
    }

    /// Records the verdict of a running project's workload
    ///
    /// Returns whether the project reached a terminal state. A workload that
    /// cannot be found counts as failed.
    async fn check_running(&self, job: &RenovateJob, project: &str) -> Result<bool> {
        let id = job.identifier();
        let selector = WorkloadSelector::executor(&id, project);

        let workload = match find_latest(self.workloads.as_ref(), &selector).await {
            Ok(workload) => Some(workload),
            Err(e) if e.is_not_found() => {
                warn!(tenant = %id, project = %project, "Workload of running project vanished");
                None
            }
            Err(e) => return Err(e),
        };

        let verdict = workload
            .as_ref()
            .map(Workload::verdict)
            .unwrap_or(ProjectState::Failed);
        if verdict == ProjectState::Running {
            return Ok(false);
        }

        let parsed = match &workload {
            Some(workload) => self.parse_logs(workload).await,
            None => LogParseResult::default(),
        };

        self.metrics.set_run_failed(
            &id.namespace,
            &id.name,
            project,
            verdict == ProjectState::Failed,
        );
        self.metrics
            .set_dependency_issues(&id.namespace, &id.name, project, parsed.has_issues);
        self.metrics
            .capture_execution(&id.namespace, &id.name, project, verdict);

        let duration = workload.as_ref().and_then(|w| w.duration(Utc::now()));
        let update = StatusUpdate::new(verdict)
            .with_result_status(parsed.result_status)
            .with_duration(duration);
        self.manager.update_status(&id, project, update).await?;

        info!(tenant = %id, project = %project, "Run finished: {}", verdict);

        if let Some(workload) = workload {
            if self.settings.delete_successful_jobs && verdict == ProjectState::Completed {
                match self.workloads.delete(&workload.namespace, &workload.name).await {
                    Ok(()) => debug!("Deleted successful workload {}", workload.name),
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(true)
    }

    /// Output of a finished workload; unreadable output yields no findings
    async fn parse_logs(&self, workload: &Workload) -> LogParseResult {
        match self.workloads.logs(workload).await {
            Ok(logs) => parse_renovate_logs(&logs),
            Err(e) => {
                warn!("Failed to read logs of workload {}: {}", workload.name, e);
                LogParseResult::default()
            }
        }
    }

    /// Launches a run of a scheduled project and marks it running
    async fn launch(&self, job: &RenovateJob, project: &str) -> Result<()> {
        let id = job.identifier();
        let spec = self.templates.executor(job, project)?;
        let selector = WorkloadSelector::executor(&id, project);

        let workload =
            create_with_generation(&self.workloads, &selector, spec, self.settings.cleanup_timeout)
                .await?;

        self.manager
            .update_status(&id, project, ProjectState::Running.into())
            .await?;

        info!(tenant = %id, project = %project, "Launched workload {}", workload.name);
        Ok(())
    }

    fn set_tenant_running(&self, fullname: &str, is_running: bool) {
        self.health.update_executor(|h| {
            h.tenants.insert(
                fullname.to_string(),
                TenantExecutionHealth { is_running },
            );
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{
        InMemorySecretRepository, InMemoryTenantRepository, InMemoryWorkloadRepository,
        ScriptedRun, TenantRepository,
    };
    use crate::service::{
        DiscoveryAgent, DiscoverySettings, InMemoryMetrics, StandardDiscoveryAgent,
        StandardJobManager, StandardWorkloadTemplates, TemplateSettings,
    };
    use renovate_core::domain::workload::{
        ConditionKind, JobType, WorkloadCondition, WorkloadStatus,
    };

    struct Fixture {
        executor: Arc<Executor>,
        manager: Arc<StandardJobManager>,
        tenants: Arc<InMemoryTenantRepository>,
        workloads: Arc<InMemoryWorkloadRepository>,
        metrics: Arc<InMemoryMetrics>,
        health: HealthCheck,
        id: RenovateJobIdentifier,
    }

    async fn fixture(parallelism: u32, delete_successful_jobs: bool) -> Fixture {
        let tenants = Arc::new(InMemoryTenantRepository::new());
        let workloads = Arc::new(InMemoryWorkloadRepository::new());
        let metrics = Arc::new(InMemoryMetrics::new());
        let health = HealthCheck::new();

        let mut job = RenovateJob::new("renovate", "tools", "*/5 * * * *");
        job.spec.image = "renovate/renovate:41".to_string();
        job.spec.parallelism = parallelism;
        let id = tenants.apply(job).await.unwrap().identifier();

        let manager = Arc::new(StandardJobManager::new(
            tenants.clone(),
            workloads.clone(),
            Arc::new(InMemorySecretRepository::new()),
            metrics.clone(),
        ));
        let templates = StandardWorkloadTemplates::new(TemplateSettings::from(&Config::default()));

        let executor = Arc::new(Executor::new(
            manager.clone(),
            workloads.clone(),
            Arc::new(templates),
            metrics.clone(),
            health.clone(),
            ExecutorSettings {
                interval: Duration::from_secs(10),
                delete_successful_jobs,
                cleanup_timeout: Duration::from_secs(5),
            },
        ));

        Fixture {
            executor,
            manager,
            tenants,
            workloads,
            metrics,
            health,
            id,
        }
    }

    async fn tick(executor: &Arc<Executor>) {
        for handle in executor.execute_once().await {
            handle.await.unwrap();
        }
    }

    async fn states(f: &Fixture) -> Vec<(String, ProjectState)> {
        f.manager
            .get_projects(&f.id)
            .await
            .unwrap()
            .into_iter()
            .map(|p| (p.name, p.status))
            .collect()
    }

    fn names(projects: &[&str]) -> Vec<String> {
        projects.iter().map(|p| p.to_string()).collect()
    }

    fn executor_workloads(workloads: &[Workload]) -> usize {
        workloads
            .iter()
            .filter(|w| w.spec.container_name == "renovate")
            .count()
    }

    fn finished(kind: ConditionKind) -> WorkloadStatus {
        let now = Utc::now();
        WorkloadStatus {
            succeeded: u32::from(kind == ConditionKind::Complete),
            failed: u32::from(kind == ConditionKind::Failed),
            start_time: Some(now - chrono::Duration::seconds(125)),
            completion_time: Some(now),
            conditions: vec![WorkloadCondition { kind, status: true }],
        }
    }

    #[tokio::test]
    async fn test_parallelism_limits_launches() {
        let f = fixture(2, false).await;
        f.manager
            .reconcile_projects(&f.id, &names(&["org/a", "org/b", "org/c"]))
            .await
            .unwrap();

        tick(&f.executor).await;

        assert_eq!(
            states(&f).await,
            vec![
                ("org/a".to_string(), ProjectState::Running),
                ("org/b".to_string(), ProjectState::Running),
                ("org/c".to_string(), ProjectState::Scheduled),
            ]
        );
        assert_eq!(executor_workloads(&f.workloads.workloads().await), 2);

        // still running, nothing more fits
        tick(&f.executor).await;
        assert_eq!(executor_workloads(&f.workloads.workloads().await), 2);
    }

    #[tokio::test]
    async fn test_zero_parallelism_launches_nothing() {
        let f = fixture(0, false).await;
        f.manager
            .reconcile_projects(&f.id, &names(&["org/a"]))
            .await
            .unwrap();

        tick(&f.executor).await;

        assert_eq!(
            states(&f).await,
            vec![("org/a".to_string(), ProjectState::Scheduled)]
        );
        assert_eq!(executor_workloads(&f.workloads.workloads().await), 0);
    }

    #[tokio::test]
    async fn test_completed_run_is_recorded() {
        let f = fixture(1, false).await;
        f.workloads
            .script(
                JobType::Executor,
                ScriptedRun {
                    status: finished(ConditionKind::Complete),
                    logs: [
                        r#"{"level":30,"msg":"Repository started"}"#,
                        r#"{"level":40,"msg":"Package lookup failures"}"#,
                        r#"{"level":30,"msg":"Repository finished","result":"disabled-no-config"}"#,
                    ]
                    .join("\n"),
                },
            )
            .await;
        f.manager
            .reconcile_projects(&f.id, &names(&["org/a", "org/b"]))
            .await
            .unwrap();

        tick(&f.executor).await;
        tick(&f.executor).await;

        let projects = f.manager.get_projects(&f.id).await.unwrap();
        assert_eq!(projects[0].status, ProjectState::Completed);
        assert_eq!(projects[0].result_status.as_deref(), Some("No Config"));
        assert_eq!(projects[0].duration.as_deref(), Some("2m 5s"));
        // the freed slot is used within the same pass
        assert_eq!(projects[1].status, ProjectState::Running);

        let recorded = f.metrics.project("tools", "renovate", "org/a").unwrap();
        assert!(!recorded.run_failed);
        assert!(recorded.dependency_issues);
        assert_eq!(recorded.executions["completed"], 1);

        // kept without the delete policy
        assert_eq!(executor_workloads(&f.workloads.workloads().await), 2);
    }

    #[tokio::test]
    async fn test_successful_workloads_are_deleted_when_enabled() {
        let f = fixture(1, true).await;
        f.workloads
            .script(
                JobType::Executor,
                ScriptedRun {
                    status: finished(ConditionKind::Complete),
                    logs: String::new(),
                },
            )
            .await;
        f.manager
            .reconcile_projects(&f.id, &names(&["org/a"]))
            .await
            .unwrap();

        tick(&f.executor).await;
        assert_eq!(executor_workloads(&f.workloads.workloads().await), 1);

        tick(&f.executor).await;
        assert_eq!(states(&f).await[0].1, ProjectState::Completed);
        assert_eq!(executor_workloads(&f.workloads.workloads().await), 0);
    }

    #[tokio::test]
    async fn test_failed_workload_is_kept() {
        let f = fixture(1, true).await;
        f.workloads
            .script(
                JobType::Executor,
                ScriptedRun {
                    status: finished(ConditionKind::Failed),
                    logs: r#"{"level":60,"msg":"fatal"}"#.to_string(),
                },
            )
            .await;
        f.manager
            .reconcile_projects(&f.id, &names(&["org/a"]))
            .await
            .unwrap();

        tick(&f.executor).await;
        tick(&f.executor).await;

        assert_eq!(states(&f).await[0].1, ProjectState::Failed);
        assert_eq!(executor_workloads(&f.workloads.workloads().await), 1);
        let recorded = f.metrics.project("tools", "renovate", "org/a").unwrap();
        assert!(recorded.run_failed);
        assert_eq!(recorded.executions["failed"], 1);
    }

    #[tokio::test]
    async fn test_vanished_workload_fails_project() {
        let f = fixture(1, false).await;
        f.manager
            .reconcile_projects(&f.id, &names(&["org/a"]))
            .await
            .unwrap();
        tick(&f.executor).await;

        for workload in f.workloads.workloads().await {
            f.workloads
                .delete(&workload.namespace, &workload.name)
                .await
                .unwrap();
        }
        tick(&f.executor).await;

        let project = f.manager.get_projects(&f.id).await.unwrap().remove(0);
        assert_eq!(project.status, ProjectState::Failed);
        assert!(project.duration.is_none());
        assert!(f.metrics.project("tools", "renovate", "org/a").unwrap().run_failed);
    }

    #[tokio::test]
    async fn test_busy_tenant_is_skipped() {
        let f = fixture(1, false).await;
        f.manager
            .reconcile_projects(&f.id, &names(&["org/a"]))
            .await
            .unwrap();

        let guard = f.executor.locks.try_lock(&f.id.fullname()).unwrap();
        assert!(f.executor.execute_once().await.is_empty());
        assert_eq!(states(&f).await[0].1, ProjectState::Scheduled);

        drop(guard);
        tick(&f.executor).await;
        assert_eq!(states(&f).await[0].1, ProjectState::Running);

        let snapshot = f.health.snapshot();
        assert!(!snapshot.executor.tenants["renovate-tools"].is_running);
    }

    #[tokio::test]
    async fn test_broken_tenant_does_not_stop_others() {
        let f = fixture(1, false).await;
        let mut broken = RenovateJob::new("broken", "tools", "@hourly");
        broken.spec.image = String::new();
        let broken = f.tenants.apply(broken).await.unwrap().identifier();

        f.manager
            .reconcile_projects(&broken, &names(&["org/x"]))
            .await
            .unwrap();
        f.manager
            .reconcile_projects(&f.id, &names(&["org/a"]))
            .await
            .unwrap();

        tick(&f.executor).await;

        assert_eq!(states(&f).await[0].1, ProjectState::Running);
        let broken_projects = f.manager.get_projects(&broken).await.unwrap();
        assert_eq!(broken_projects[0].status, ProjectState::Scheduled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_stops_on_cancel() {
        let f = fixture(1, false).await;
        let token = CancellationToken::new();
        let handle = Arc::clone(&f.executor).start(token.clone());

        time::sleep(Duration::from_secs(1)).await;
        assert!(f.health.snapshot().executor.running);

        token.cancel();
        handle.await.unwrap();
        assert!(!f.health.snapshot().executor.running);
    }

    #[tokio::test]
    async fn test_discovery_to_first_launch() {
        let f = fixture(1, false).await;
        f.workloads
            .script(
                JobType::Discovery,
                ScriptedRun {
                    status: WorkloadStatus {
                        succeeded: 1,
                        ..Default::default()
                    },
                    logs: r#"["org/b","org/a"]"#.to_string(),
                },
            )
            .await;

        let templates = StandardWorkloadTemplates::new(TemplateSettings::from(&Config::default()));
        let discovery = StandardDiscoveryAgent::new(
            f.workloads.clone(),
            Arc::new(templates),
            DiscoverySettings::from(&Config::default()),
            CancellationToken::new(),
        );

        let job = f.manager.get(&f.id).await.unwrap();
        let projects = discovery.discover(&job).await.unwrap();
        f.manager.reconcile_projects(&f.id, &projects).await.unwrap();
        assert_eq!(
            states(&f).await,
            vec![
                ("org/a".to_string(), ProjectState::Scheduled),
                ("org/b".to_string(), ProjectState::Scheduled),
            ]
        );

        tick(&f.executor).await;

        assert_eq!(
            states(&f).await,
            vec![
                ("org/a".to_string(), ProjectState::Running),
                ("org/b".to_string(), ProjectState::Scheduled),
            ]
        );
        assert_eq!(executor_workloads(&f.workloads.workloads().await), 1);
    }
}
