//! Metrics service
//!
//! Receives run outcomes and project removals. The in-memory sink keeps the
//! latest values per project so they can be inspected or exported.

use dashmap::DashMap;
use renovate_core::domain::project::ProjectState;
use std::collections::BTreeMap;

/// Service trait for recording run metrics
pub trait MetricsSink: Send + Sync {
    /// Records whether the last run of a project failed
    fn set_run_failed(&self, namespace: &str, job: &str, project: &str, failed: bool);

    /// Records whether the last run of a project logged warnings or errors
    fn set_dependency_issues(&self, namespace: &str, job: &str, project: &str, has_issues: bool);

    /// Counts one finished run of a project
    fn capture_execution(&self, namespace: &str, job: &str, project: &str, status: ProjectState);

    /// Drops every metric of a project that is no longer discovered
    fn delete_project_metrics(&self, namespace: &str, job: &str, project: &str);
}

/// Identity of a project across tenants
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProjectKey {
    pub namespace: String,
    pub job: String,
    pub project: String,
}

impl ProjectKey {
    pub fn new(namespace: &str, job: &str, project: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            job: job.to_string(),
            project: project.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectMetrics {
    pub run_failed: bool,
    pub dependency_issues: bool,
    /// Finished runs by terminal status
    pub executions: BTreeMap<String, u64>,
}

/// In-memory implementation of MetricsSink
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    projects: DashMap<ProjectKey, ProjectMetrics>,
    deletions: DashMap<ProjectKey, u32>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current metrics of a project
    pub fn project(&self, namespace: &str, job: &str, project: &str) -> Option<ProjectMetrics> {
        self.projects
            .get(&ProjectKey::new(namespace, job, project))
            .map(|m| m.clone())
    }

    /// How often the metrics of a project were deleted
    pub fn deletions(&self, namespace: &str, job: &str, project: &str) -> u32 {
        self.deletions
            .get(&ProjectKey::new(namespace, job, project))
            .map(|d| *d)
            .unwrap_or(0)
    }
}

impl MetricsSink for InMemoryMetrics {
    fn set_run_failed(&self, namespace: &str, job: &str, project: &str, failed: bool) {
        self.projects
            .entry(ProjectKey::new(namespace, job, project))
            .or_default()
            .run_failed = failed;
    }

    fn set_dependency_issues(&self, namespace: &str, job: &str, project: &str, has_issues: bool) {
        self.projects
            .entry(ProjectKey::new(namespace, job, project))
            .or_default()
            .dependency_issues = has_issues;
    }

    fn capture_execution(&self, namespace: &str, job: &str, project: &str, status: ProjectState) {
        *self
            .projects
            .entry(ProjectKey::new(namespace, job, project))
            .or_default()
            .executions
            .entry(status.as_str().to_string())
            .or_default() += 1;
    }

    fn delete_project_metrics(&self, namespace: &str, job: &str, project: &str) {
        let key = ProjectKey::new(namespace, job, project);
        self.projects.remove(&key);
        *self.deletions.entry(key).or_default() += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_and_deletes() {
        let metrics = InMemoryMetrics::new();
        metrics.set_run_failed("tools", "renovate", "org/a", true);
        metrics.set_dependency_issues("tools", "renovate", "org/a", true);
        metrics.capture_execution("tools", "renovate", "org/a", ProjectState::Failed);
        metrics.capture_execution("tools", "renovate", "org/a", ProjectState::Failed);

        let recorded = metrics.project("tools", "renovate", "org/a").unwrap();
        assert!(recorded.run_failed);
        assert!(recorded.dependency_issues);
        assert_eq!(recorded.executions["failed"], 2);

        metrics.delete_project_metrics("tools", "renovate", "org/a");
        assert!(metrics.project("tools", "renovate", "org/a").is_none());
        assert_eq!(metrics.deletions("tools", "renovate", "org/a"), 1);
        assert_eq!(metrics.deletions("tools", "renovate", "org/b"), 0);
    }
}
