//! Workload template service
//!
//! Builds the workload specifications for discovery probes and project runs
//! from a renovate job. Pure functions of the job and the operator settings.

use renovate_core::domain::job::RenovateJob;
use renovate_core::domain::workload::{
    ContainerSecurityContext, EnvVar, PodSecurityContext, Volume, WorkloadSelector, WorkloadSpec,
};

use crate::config::Config;
use crate::error::{OperatorError, Result};

const DEFAULT_USER_ID: i64 = 12021;
const SECCOMP_RUNTIME_DEFAULT: &str = "RuntimeDefault";
const SCRATCH_VOLUME: &str = "tmp";
const SCRATCH_PATH: &str = "/tmp";

const DISCOVERY_SCRIPT: &str = "renovate --autodiscover --write-discovered-repos /tmp/repos.json >> /tmp/logs.json 2>&1 && cat /tmp/repos.json || cat /tmp/logs.json";

/// Service trait for building workload specifications
pub trait WorkloadTemplates: Send + Sync {
    /// Specification of the discovery probe of a job
    fn discovery(&self, job: &RenovateJob) -> Result<WorkloadSpec>;

    /// Specification of one run of `project`
    ///
    /// # Arguments
    /// * `job` - The renovate job owning the project
    /// * `project` - Repository handed to the runner
    fn executor(&self, job: &RenovateJob, project: &str) -> Result<WorkloadSpec>;
}

/// Operator level workload settings
#[derive(Debug, Clone)]
pub struct TemplateSettings {
    pub active_deadline_seconds: i64,
    pub backoff_limit: i32,
    pub ttl_seconds_after_finished: Option<i32>,
    pub image_pull_secrets: Vec<String>,
}

impl From<&Config> for TemplateSettings {
    fn from(config: &Config) -> Self {
        Self {
            active_deadline_seconds: config.job_timeout.as_secs() as i64,
            backoff_limit: config.job_backoff_limit,
            ttl_seconds_after_finished: config.job_ttl_after_finished,
            image_pull_secrets: config.image_pull_secrets.clone(),
        }
    }
}

/// Standard implementation of WorkloadTemplates
pub struct StandardWorkloadTemplates {
    settings: TemplateSettings,
}

impl StandardWorkloadTemplates {
    pub fn new(settings: TemplateSettings) -> Self {
        Self { settings }
    }

    /// Settings shared by discovery and executor workloads
    fn base(
        &self,
        job: &RenovateJob,
        selector: &WorkloadSelector,
        container_name: &str,
        predefined_env: Vec<EnvVar>,
    ) -> Result<WorkloadSpec> {
        if job.spec.image.trim().is_empty() {
            return Err(OperatorError::Template(format!(
                "renovate job {} has no image",
                job.identifier()
            )));
        }

        let (mut labels, annotations) = match &job.spec.metadata {
            Some(metadata) => (metadata.labels.clone(), metadata.annotations.clone()),
            None => Default::default(),
        };
        labels.extend(selector.labels());

        let overrides = job.spec.security_context.clone().unwrap_or_default();
        let service_account = job.spec.service_account.clone().unwrap_or_default();

        let mut image_pull_secrets = job.spec.image_pull_secrets.clone();
        image_pull_secrets.extend(self.settings.image_pull_secrets.iter().cloned());

        Ok(WorkloadSpec {
            generate_name: format!("{}-", selector.job_name),
            namespace: job.namespace().to_string(),
            labels,
            annotations,
            container_name: container_name.to_string(),
            image: job.spec.image.clone(),
            env: merge_env(&job.spec.extra_env, predefined_env),
            env_from_secrets: job.spec.secret_ref.iter().cloned().collect(),
            volumes: vec![Volume {
                name: SCRATCH_VOLUME.to_string(),
                mount_path: SCRATCH_PATH.to_string(),
            }],
            resources: job.spec.resources.clone(),
            pod_security_context: overrides.pod.unwrap_or_else(default_pod_security),
            container_security_context: overrides
                .container
                .unwrap_or_else(default_container_security),
            service_account_name: service_account.name,
            automount_service_account_token: service_account
                .automount_service_account_token
                .unwrap_or(false),
            image_pull_secrets,
            scheduling: job.spec.scheduling.clone(),
            active_deadline_seconds: Some(self.settings.active_deadline_seconds),
            backoff_limit: Some(self.settings.backoff_limit),
            owner: Some(job.identifier()),
            ..Default::default()
        })
    }
}

impl WorkloadTemplates for StandardWorkloadTemplates {
    fn discovery(&self, job: &RenovateJob) -> Result<WorkloadSpec> {
        let mut env = vec![
            EnvVar::new("LOG_FORMAT", "json"),
            EnvVar::new("NODE_NO_WARNINGS", "1"),
        ];
        if let Some(filter) = &job.spec.discovery_filter {
            env.push(EnvVar::new("RENOVATE_AUTODISCOVER_FILTER", filter));
        }
        if let Some(topics) = &job.spec.discover_topics {
            env.push(EnvVar::new("RENOVATE_AUTODISCOVER_TOPICS", topics));
        }

        let selector = WorkloadSelector::discovery(&job.identifier());
        let mut spec = self.base(job, &selector, "discovery", env)?;
        spec.command = vec!["/bin/sh".to_string(), "-c".to_string()];
        spec.args = vec![DISCOVERY_SCRIPT.to_string()];

        Ok(spec)
    }

    fn executor(&self, job: &RenovateJob, project: &str) -> Result<WorkloadSpec> {
        if project.trim().is_empty() {
            return Err(OperatorError::Template("project name is empty".to_string()));
        }

        let env = vec![EnvVar::new("LOG_FORMAT", "json")];

        let selector = WorkloadSelector::executor(&job.identifier(), project);
        let mut spec = self.base(job, &selector, "renovate", env)?;
        spec.command = vec!["renovate".to_string()];
        spec.args = vec![
            "--base-dir".to_string(),
            SCRATCH_PATH.to_string(),
            project.to_string(),
        ];
        spec.ttl_seconds_after_finished = self.settings.ttl_seconds_after_finished;

        Ok(spec)
    }
}

fn default_pod_security() -> PodSecurityContext {
    PodSecurityContext {
        run_as_user: Some(DEFAULT_USER_ID),
        run_as_group: Some(DEFAULT_USER_ID),
        fs_group: Some(DEFAULT_USER_ID),
        run_as_non_root: Some(true),
        seccomp_profile: Some(SECCOMP_RUNTIME_DEFAULT.to_string()),
    }
}

fn default_container_security() -> ContainerSecurityContext {
    ContainerSecurityContext {
        run_as_user: None,
        run_as_group: None,
        run_as_non_root: Some(true),
        seccomp_profile: Some(SECCOMP_RUNTIME_DEFAULT.to_string()),
        read_only_root_filesystem: Some(false),
        privileged: Some(false),
        allow_privilege_escalation: Some(false),
        drop_capabilities: vec!["ALL".to_string()],
    }
}

/// Tenant variables first; predefined ones only when not overridden
fn merge_env(extra: &[EnvVar], predefined: Vec<EnvVar>) -> Vec<EnvVar> {
    let mut merged = extra.to_vec();
    for env in predefined {
        if !extra.iter().any(|e| e.name == env.name) {
            merged.push(env);
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use renovate_core::domain::job::{SecurityContextOverride, WorkloadMetadata};
    use renovate_core::domain::workload::{LABEL_JOB_NAME, LABEL_JOB_TYPE};
    use std::collections::BTreeMap;

    fn templates() -> StandardWorkloadTemplates {
        let mut config = Config::default();
        config.job_ttl_after_finished = Some(600);
        config.image_pull_secrets = vec!["operator-pull".to_string()];
        StandardWorkloadTemplates::new(TemplateSettings::from(&config))
    }

    fn job() -> RenovateJob {
        let mut job = RenovateJob::new("renovate", "tools", "*/5 * * * *");
        job.spec.image = "renovate/renovate:41".to_string();
        job.spec.secret_ref = Some("renovate-env".to_string());
        job
    }

    #[test]
    fn test_discovery_spec() {
        let mut job = job();
        job.spec.discovery_filter = Some("org/*".to_string());

        let spec = templates().discovery(&job).unwrap();
        assert_eq!(spec.container_name, "discovery");
        assert_eq!(spec.command, vec!["/bin/sh", "-c"]);
        assert!(spec.args[0].contains("--write-discovered-repos /tmp/repos.json"));
        assert_eq!(spec.labels[LABEL_JOB_TYPE], "discovery");
        assert_eq!(spec.labels[LABEL_JOB_NAME], "renovate-tools-discovery");
        assert_eq!(spec.generate_name, "renovate-tools-discovery-");
        assert!(spec.env.contains(&EnvVar::new("RENOVATE_AUTODISCOVER_FILTER", "org/*")));
        assert!(!spec.env.iter().any(|e| e.name == "RENOVATE_AUTODISCOVER_TOPICS"));
        assert_eq!(spec.env_from_secrets, vec!["renovate-env"]);
        assert!(spec.ttl_seconds_after_finished.is_none());
        assert_eq!(spec.active_deadline_seconds, Some(1800));
    }

    #[test]
    fn test_executor_spec() {
        let spec = templates().executor(&job(), "org/a").unwrap();
        assert_eq!(spec.container_name, "renovate");
        assert_eq!(spec.command, vec!["renovate"]);
        assert_eq!(spec.args, vec!["--base-dir", "/tmp", "org/a"]);
        assert_eq!(spec.labels[LABEL_JOB_TYPE], "executor");
        assert_eq!(spec.ttl_seconds_after_finished, Some(600));
        assert_eq!(spec.image_pull_secrets, vec!["operator-pull"]);
        assert_eq!(spec.volumes[0].mount_path, "/tmp");
        assert!(!spec.automount_service_account_token);
        assert_eq!(spec.owner, Some(job().identifier()));
    }

    #[test]
    fn test_default_security_posture() {
        let spec = templates().executor(&job(), "org/a").unwrap();
        assert_eq!(spec.pod_security_context.run_as_user, Some(12021));
        assert_eq!(spec.pod_security_context.fs_group, Some(12021));
        assert_eq!(spec.pod_security_context.run_as_non_root, Some(true));
        assert_eq!(spec.container_security_context.allow_privilege_escalation, Some(false));
        assert_eq!(spec.container_security_context.drop_capabilities, vec!["ALL"]);
    }

    #[test]
    fn test_tenant_overrides() {
        let mut job = job();
        job.spec.extra_env = vec![EnvVar::new("LOG_FORMAT", "pretty")];
        job.spec.security_context = Some(SecurityContextOverride {
            pod: Some(PodSecurityContext {
                run_as_user: Some(1000),
                ..Default::default()
            }),
            container: None,
        });
        job.spec.metadata = Some(WorkloadMetadata {
            labels: BTreeMap::from([
                ("team".to_string(), "platform".to_string()),
                (LABEL_JOB_TYPE.to_string(), "spoofed".to_string()),
            ]),
            annotations: BTreeMap::from([("owner".to_string(), "ops".to_string())]),
        });

        let spec = templates().executor(&job, "org/a").unwrap();
        assert_eq!(spec.env, vec![EnvVar::new("LOG_FORMAT", "pretty")]);
        assert_eq!(spec.pod_security_context.run_as_user, Some(1000));
        assert!(spec.pod_security_context.fs_group.is_none());
        assert_eq!(spec.container_security_context.drop_capabilities, vec!["ALL"]);
        assert_eq!(spec.labels["team"], "platform");
        assert_eq!(spec.labels[LABEL_JOB_TYPE], "executor");
        assert_eq!(spec.annotations["owner"], "ops");
    }

    #[test]
    fn test_missing_image_is_rejected() {
        let mut job = job();
        job.spec.image = String::new();
        assert!(matches!(
            templates().discovery(&job),
            Err(OperatorError::Template(_))
        ));
        assert!(templates().executor(&self::job(), " ").is_err());
    }
}
