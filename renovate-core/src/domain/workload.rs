//! Workload domain types
//!
//! A workload is an ephemeral unit of work launched in the remote store:
//! either the discovery probe of a job or one runner execution for a project.
//! Workloads are correlated back to their purpose through three labels
//! (job type, logical job name, generation).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::job::{RenovateJobIdentifier, SchedulingConstraints};
use crate::domain::project::ProjectState;
use crate::naming;

pub const LABEL_JOB_TYPE: &str = "renovate-operator.mogenius.com/job-type";
pub const LABEL_JOB_NAME: &str = "renovate-operator.mogenius.com/job-name";
pub const LABEL_GENERATION: &str = "renovate-operator.mogenius.com/generation";

/// Purpose of a workload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Discovery,
    Executor,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Discovery => "discovery",
            JobType::Executor => "executor",
        }
    }

    /// Parses the value of the job-type label
    pub fn from_label(value: &str) -> Option<Self> {
        match value {
            "discovery" => Some(JobType::Discovery),
            "executor" => Some(JobType::Executor),
            _ => None,
        }
    }
}

/// Label selector identifying all generations of one logical workload
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkloadSelector {
    pub job_name: String,
    pub job_type: JobType,
    pub namespace: String,
}

impl WorkloadSelector {
    /// Selector of the discovery probe of a job
    pub fn discovery(job: &RenovateJobIdentifier) -> Self {
        Self {
            job_name: naming::discovery_job_name(job),
            job_type: JobType::Discovery,
            namespace: job.namespace.clone(),
        }
    }

    /// Selector of the execution workload of one project
    pub fn executor(job: &RenovateJobIdentifier, project: &str) -> Self {
        Self {
            job_name: naming::executor_job_name(job, project),
            job_type: JobType::Executor,
            namespace: job.namespace.clone(),
        }
    }

    /// Labels every workload matching this selector carries
    pub fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_JOB_TYPE.to_string(), self.job_type.as_str().to_string()),
            (LABEL_JOB_NAME.to_string(), self.job_name.clone()),
        ])
    }

    pub fn matches(&self, workload: &Workload) -> bool {
        workload.namespace == self.namespace
            && self
                .labels()
                .iter()
                .all(|(k, v)| workload.labels.get(k) == Some(v))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

impl EnvVar {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Scratch volume mounted into the workload container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub name: String,
    pub mount_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSecurityContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_user: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_group: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_group: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_non_root: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seccomp_profile: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSecurityContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_user: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_group: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_non_root: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seccomp_profile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only_root_filesystem: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub privileged: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_privilege_escalation: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub drop_capabilities: Vec<String>,
}

/// Fully formed workload specification, as produced by the template builder
///
/// The core treats this as opaque apart from `namespace` and `labels`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpec {
    /// Name prefix; the store appends a unique suffix
    pub generate_name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    pub container_name: String,
    pub image: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub env_from_secrets: Vec<String>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
    #[serde(default)]
    pub resources: Option<serde_json::Value>,
    #[serde(default)]
    pub pod_security_context: PodSecurityContext,
    #[serde(default)]
    pub container_security_context: ContainerSecurityContext,
    #[serde(default)]
    pub service_account_name: Option<String>,
    #[serde(default)]
    pub automount_service_account_token: bool,
    #[serde(default)]
    pub image_pull_secrets: Vec<String>,
    #[serde(default)]
    pub scheduling: SchedulingConstraints,
    #[serde(default)]
    pub active_deadline_seconds: Option<i64>,
    #[serde(default)]
    pub backoff_limit: Option<i32>,
    #[serde(default)]
    pub ttl_seconds_after_finished: Option<i32>,
    /// Renovate job owning the workload
    #[serde(default)]
    pub owner: Option<RenovateJobIdentifier>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionKind {
    Complete,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadCondition {
    pub kind: ConditionKind,
    pub status: bool,
}

/// Store-driven status of a workload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadStatus {
    #[serde(default)]
    pub succeeded: u32,
    #[serde(default)]
    pub failed: u32,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completion_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub conditions: Vec<WorkloadCondition>,
}

/// A workload as stored in the remote store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workload {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub spec: WorkloadSpec,
    #[serde(default)]
    pub status: WorkloadStatus,
}

impl Workload {
    /// Generation stamp; missing or invalid labels count as generation 0
    pub fn generation(&self) -> i64 {
        self.labels
            .get(LABEL_GENERATION)
            .and_then(|g| g.parse::<i64>().ok())
            .unwrap_or(0)
    }

    /// Verdict of an execution workload, derived from its conditions
    pub fn verdict(&self) -> ProjectState {
        for condition in &self.status.conditions {
            if !condition.status {
                continue;
            }
            match condition.kind {
                ConditionKind::Complete => return ProjectState::Completed,
                ConditionKind::Failed => return ProjectState::Failed,
            }
        }
        ProjectState::Running
    }

    /// State of a discovery probe, derived from its pod counters
    pub fn probe_state(&self) -> ProjectState {
        if self.status.failed > 0 {
            ProjectState::Failed
        } else if self.status.succeeded > 0 {
            ProjectState::Completed
        } else {
            ProjectState::Running
        }
    }

    /// Human readable run time; runs still in progress are measured up to `now`
    pub fn duration(&self, now: DateTime<Utc>) -> Option<String> {
        let start = self.status.start_time?;
        let end = self.status.completion_time.unwrap_or(now);
        Some(human_duration(end - start))
    }
}

/// Picks the workload with the highest generation, ties broken by creation time
pub fn latest_generation(workloads: Vec<Workload>) -> Option<Workload> {
    workloads
        .into_iter()
        .max_by(|a, b| {
            a.generation()
                .cmp(&b.generation())
                .then(a.created_at.cmp(&b.created_at))
        })
}

/// Formats a duration as `1h 2m 3s`, `2m 3s` or `3s`
pub fn human_duration(duration: Duration) -> String {
    let total = duration.num_seconds().max(0);
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workload(name: &str, generation: Option<&str>, created_offset: i64) -> Workload {
        let mut labels = BTreeMap::new();
        if let Some(g) = generation {
            labels.insert(LABEL_GENERATION.to_string(), g.to_string());
        }
        Workload {
            name: name.to_string(),
            namespace: "tools".to_string(),
            labels,
            created_at: DateTime::from_timestamp(created_offset, 0).unwrap(),
            spec: WorkloadSpec::default(),
            status: WorkloadStatus::default(),
        }
    }

    #[test]
    fn test_latest_generation_prefers_highest_label() {
        let picked = latest_generation(vec![
            workload("old", Some("100"), 5),
            workload("new", Some("200"), 1),
            workload("unlabeled", None, 9),
            workload("garbage", Some("abc"), 10),
        ])
        .unwrap();
        assert_eq!(picked.name, "new");
    }

    #[test]
    fn test_latest_generation_breaks_ties_by_creation() {
        let picked = latest_generation(vec![
            workload("first", Some("100"), 1),
            workload("second", Some("100"), 2),
        ])
        .unwrap();
        assert_eq!(picked.name, "second");
        assert!(latest_generation(Vec::new()).is_none());
    }

    #[test]
    fn test_verdict_from_conditions() {
        let mut w = workload("w", None, 0);
        assert_eq!(w.verdict(), ProjectState::Running);

        w.status.conditions.push(WorkloadCondition {
            kind: ConditionKind::Failed,
            status: false,
        });
        assert_eq!(w.verdict(), ProjectState::Running);

        w.status.conditions.push(WorkloadCondition {
            kind: ConditionKind::Complete,
            status: true,
        });
        assert_eq!(w.verdict(), ProjectState::Completed);

        w.status.conditions = vec![WorkloadCondition {
            kind: ConditionKind::Failed,
            status: true,
        }];
        assert_eq!(w.verdict(), ProjectState::Failed);
    }

    #[test]
    fn test_probe_state_from_counters() {
        let mut w = workload("probe", None, 0);
        assert_eq!(w.probe_state(), ProjectState::Running);
        w.status.succeeded = 1;
        assert_eq!(w.probe_state(), ProjectState::Completed);
        w.status.failed = 1;
        assert_eq!(w.probe_state(), ProjectState::Failed);
    }

    #[test]
    fn test_human_duration() {
        assert_eq!(human_duration(Duration::seconds(45)), "45s");
        assert_eq!(human_duration(Duration::seconds(125)), "2m 5s");
        assert_eq!(human_duration(Duration::seconds(3725)), "1h 2m 5s");
        assert_eq!(human_duration(Duration::seconds(-3)), "0s");
    }

    #[test]
    fn test_selector_matches_labels_and_namespace() {
        let job = RenovateJobIdentifier::new("renovate", "tools");
        let selector = WorkloadSelector::executor(&job, "org/a");

        let mut w = workload("w", Some("1"), 0);
        w.labels.extend(selector.labels());
        assert!(selector.matches(&w));

        w.namespace = "other".to_string();
        assert!(!selector.matches(&w));

        let discovery = WorkloadSelector::discovery(&job);
        assert_ne!(discovery.job_name, selector.job_name);
    }
}
