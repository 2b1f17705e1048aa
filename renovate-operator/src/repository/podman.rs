//! Podman workload store
//!
//! Runs execution workloads as podman containers on the local host:
//! - Checking podman availability
//! - Creating one detached container per workload, carrying the workload labels
//! - Listing containers by label and mapping their state to workload status
//! - Reading container output and removing containers
//!
//! Scheduling constraints, service accounts and pull secrets have no podman
//! counterpart and are ignored.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use renovate_core::domain::workload::{
    ConditionKind, Workload, WorkloadCondition, WorkloadSpec, WorkloadStatus,
};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use tokio::process::Command;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::{OperatorError, Result};
use crate::repository::WorkloadRepository;

/// Label carrying the namespace of a workload, podman has none of its own
pub const LABEL_NAMESPACE: &str = "renovate-operator.mogenius.com/namespace";

/// Checks if podman is installed and available
pub async fn check_podman_available() -> Result<()> {
    let output = Command::new("podman")
        .arg("--version")
        .output()
        .await
        .map_err(|e| {
            OperatorError::store(format!(
                "Failed to execute 'podman --version'. Is podman installed? {}",
                e
            ))
        })?;

    if !output.status.success() {
        return Err(OperatorError::store("Podman is not working correctly"));
    }

    let version = String::from_utf8_lossy(&output.stdout);
    info!("Podman is available: {}", version.trim());

    Ok(())
}

/// Seconds a container may stay `created` before it counts as failed to start
///
/// `podman run -d` returns once the container started, so a container that
/// lingers in `created` never got going.
const CREATED_START_GRACE_SECS: i64 = 120;

type SecretKey = (String, String);

/// Podman implementation of WorkloadRepository
pub struct PodmanWorkloadRepository {
    /// Credentials referenced by `env_from_secrets`, keyed by namespace and name
    secrets: HashMap<SecretKey, BTreeMap<String, String>>,
}

impl PodmanWorkloadRepository {
    /// Creates a new podman workload store
    ///
    /// # Arguments
    /// * `secrets` - Secret data exposed to containers that reference it
    pub fn new(secrets: HashMap<SecretKey, BTreeMap<String, String>>) -> Self {
        Self { secrets }
    }

    /// Builds the `podman run` invocation for a workload
    fn run_command(&self, name: &str, spec: &WorkloadSpec) -> Result<Command> {
        let mut command = Command::new("podman");
        command.arg("run").arg("-d").arg("--name").arg(name);

        command
            .arg("--label")
            .arg(format!("{}={}", LABEL_NAMESPACE, spec.namespace));
        for (key, value) in &spec.labels {
            command.arg("--label").arg(format!("{}={}", key, value));
        }
        for (key, value) in &spec.annotations {
            command.arg("--annotation").arg(format!("{}={}", key, value));
        }

        for env in &spec.env {
            command.arg("-e").arg(format!("{}={}", env.name, env.value));
        }

        // secret values travel through the podman process environment, never argv
        for secret in &spec.env_from_secrets {
            let data = self
                .secrets
                .get(&(spec.namespace.clone(), secret.clone()))
                .ok_or_else(|| {
                    OperatorError::not_found(format!("secret {}/{}", spec.namespace, secret))
                })?;
            for (key, value) in data {
                command.arg("-e").arg(key);
                command.env(key, value);
            }
        }

        for volume in &spec.volumes {
            command
                .arg("--mount")
                .arg(format!("type=tmpfs,destination={}", volume.mount_path));
        }

        let pod = &spec.pod_security_context;
        let container = &spec.container_security_context;
        if let Some(uid) = container.run_as_user.or(pod.run_as_user) {
            let gid = container.run_as_group.or(pod.run_as_group).unwrap_or(uid);
            command.arg("--user").arg(format!("{}:{}", uid, gid));
        }
        if let Some(fs_group) = pod.fs_group {
            command.arg("--group-add").arg(fs_group.to_string());
        }
        if container.allow_privilege_escalation == Some(false) {
            command.arg("--security-opt").arg("no-new-privileges");
        }
        for capability in &container.drop_capabilities {
            command.arg("--cap-drop").arg(capability);
        }
        if container.read_only_root_filesystem == Some(true) {
            command.arg("--read-only");
        }
        if container.privileged == Some(true) {
            command.arg("--privileged");
        }

        if let Some(deadline) = spec.active_deadline_seconds {
            command.arg("--timeout").arg(deadline.to_string());
        }
        if let Some(limit) = spec.backoff_limit.filter(|l| *l > 0) {
            command.arg("--restart").arg(format!("on-failure:{}", limit));
        }

        if !spec.command.is_empty() {
            let entrypoint = serde_json::to_string(&spec.command)
                .map_err(|e| OperatorError::Template(e.to_string()))?;
            command.arg("--entrypoint").arg(entrypoint);
        }

        command.arg(&spec.image);
        command.args(&spec.args);

        Ok(command)
    }
}

#[async_trait]
impl WorkloadRepository for PodmanWorkloadRepository {
    async fn create(&self, spec: WorkloadSpec) -> Result<Workload> {
        let suffix = Uuid::new_v4().simple().to_string();
        let name = format!("{}{}", spec.generate_name, &suffix[..5]);

        info!("Creating container {} from image {}", name, spec.image);

        let output = self
            .run_command(&name, &spec)?
            .output()
            .await
            .map_err(|e| OperatorError::store(format!("Failed to execute podman run: {}", e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !stderr.trim().is_empty() {
            debug!("podman run stderr: {}", stderr.trim());
        }

        if !output.status.success() {
            let exit_code = output.status.code().unwrap_or(-1);
            let error_msg = format!(
                "Failed to start container {}: exit_code={}, stderr='{}'",
                name,
                exit_code,
                stderr.trim()
            );
            error!("{}", error_msg);
            return Err(OperatorError::Store(error_msg));
        }

        debug!("Container {} started with ID: {}", name, stdout.trim());

        let now = Utc::now();
        Ok(Workload {
            name,
            namespace: spec.namespace.clone(),
            labels: spec.labels.clone(),
            created_at: now,
            spec,
            status: WorkloadStatus {
                start_time: Some(now),
                ..Default::default()
            },
        })
    }

    async fn list(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Workload>> {
        let mut command = Command::new("podman");
        command
            .arg("ps")
            .arg("-a")
            .arg("--format")
            .arg("json")
            .arg("--filter")
            .arg(format!("label={}={}", LABEL_NAMESPACE, namespace));
        for (key, value) in labels {
            command.arg("--filter").arg(format!("label={}={}", key, value));
        }

        let output = command
            .output()
            .await
            .map_err(|e| OperatorError::store(format!("Failed to execute podman ps: {}", e)))?;

        if !output.status.success() {
            return Err(OperatorError::store(format!(
                "podman ps failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        parse_container_list(&output.stdout, Utc::now())
    }

    async fn delete(&self, _namespace: &str, name: &str) -> Result<()> {
        let output = Command::new("podman")
            .arg("rm")
            .arg("-f")
            .arg(name)
            .output()
            .await
            .map_err(|e| OperatorError::store(format!("Failed to execute podman rm: {}", e)))?;

        if output.status.success() {
            debug!("Container {} removed", name);
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.to_lowercase().contains("no such container") {
            return Err(OperatorError::not_found(format!("container {}", name)));
        }

        Err(OperatorError::store(format!(
            "Failed to remove container {}: {}",
            name,
            stderr.trim()
        )))
    }

    async fn logs(&self, workload: &Workload) -> Result<String> {
        let output = Command::new("podman")
            .arg("logs")
            .arg(&workload.name)
            .output()
            .await
            .map_err(|e| OperatorError::store(format!("Failed to execute podman logs: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.to_lowercase().contains("no such container") {
                return Err(OperatorError::not_found(format!("container {}", workload.name)));
            }
            return Err(OperatorError::store(format!(
                "podman logs failed for {}: {}",
                workload.name,
                stderr.trim()
            )));
        }

        let mut logs = String::from_utf8_lossy(&output.stdout).into_owned();
        logs.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(logs)
    }
}

// =============================================================================
// podman ps output
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerInfo {
    #[serde(default)]
    names: Vec<String>,
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
    #[serde(default)]
    created: i64,
    #[serde(default)]
    state: String,
    #[serde(default)]
    exit_code: i32,
    #[serde(default)]
    started_at: i64,
    #[serde(default)]
    exited_at: i64,
}

fn timestamp(secs: i64) -> Option<DateTime<Utc>> {
    if secs <= 0 {
        return None;
    }
    DateTime::from_timestamp(secs, 0)
}

impl ContainerInfo {
    fn into_workload(self, now: DateTime<Utc>) -> Option<Workload> {
        let name = self.names.into_iter().next()?;
        let labels = self.labels.unwrap_or_default();
        let namespace = labels.get(LABEL_NAMESPACE).cloned().unwrap_or_default();

        let created_at = timestamp(self.created).unwrap_or(now);
        let mut status = WorkloadStatus {
            start_time: timestamp(self.started_at),
            ..Default::default()
        };

        let outcome = match self.state.as_str() {
            "exited" | "stopped" if self.exit_code == 0 => Some(ConditionKind::Complete),
            "exited" | "stopped" | "dead" => Some(ConditionKind::Failed),
            "created" if now - created_at > TimeDelta::seconds(CREATED_START_GRACE_SECS) => {
                Some(ConditionKind::Failed)
            }
            _ => None,
        };
        if let Some(kind) = outcome {
            match kind {
                ConditionKind::Complete => status.succeeded = 1,
                ConditionKind::Failed => status.failed = 1,
            }
            status.completion_time = timestamp(self.exited_at);
            status.conditions.push(WorkloadCondition { kind, status: true });
        }

        Some(Workload {
            name,
            namespace: namespace.clone(),
            created_at,
            spec: WorkloadSpec {
                namespace,
                labels: labels.clone(),
                ..Default::default()
            },
            labels,
            status,
        })
    }
}

fn parse_container_list(raw: &[u8], now: DateTime<Utc>) -> Result<Vec<Workload>> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }

    let containers: Vec<ContainerInfo> = serde_json::from_slice(raw)
        .map_err(|e| OperatorError::store(format!("Failed to parse podman ps output: {}", e)))?;

    Ok(containers
        .into_iter()
        .filter_map(|c| c.into_workload(now))
        .collect())
}
