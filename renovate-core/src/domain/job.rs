//! Renovate job domain types
//!
//! A renovate job is a tenant: a group of projects sharing one schedule,
//! one runner image and one set of credentials.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::domain::project::{ProjectState, ProjectStatus};
use crate::domain::workload::{ContainerSecurityContext, EnvVar, PodSecurityContext};

/// Identity of a renovate job inside the control plane
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RenovateJobIdentifier {
    pub name: String,
    pub namespace: String,
}

impl RenovateJobIdentifier {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    /// Unique key `${name}-${namespace}`, used by the scheduler and lock tables
    pub fn fullname(&self) -> String {
        format!("{}-{}", self.name, self.namespace)
    }
}

impl fmt::Display for RenovateJobIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Object metadata as kept by the remote store
///
/// `resource_version` is the optimistic concurrency token: the store rejects
/// an update whose version does not match the stored one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// The tenant resource: desired state in `spec`, observed state in `status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenovateJob {
    pub metadata: ObjectMeta,
    pub spec: RenovateJobSpec,
    #[serde(default)]
    pub status: RenovateJobStatus,
}

impl RenovateJob {
    /// Creates a job with the given schedule and otherwise default settings
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        schedule: impl Into<String>,
    ) -> Self {
        Self {
            metadata: ObjectMeta {
                name: name.into(),
                namespace: namespace.into(),
                ..Default::default()
            },
            spec: RenovateJobSpec {
                schedule: schedule.into(),
                ..Default::default()
            },
            status: RenovateJobStatus::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    pub fn identifier(&self) -> RenovateJobIdentifier {
        RenovateJobIdentifier::new(&self.metadata.name, &self.metadata.namespace)
    }

    pub fn fullname(&self) -> String {
        self.identifier().fullname()
    }

    /// Looks up the status record of a project by name
    pub fn project(&self, name: &str) -> Option<&ProjectStatus> {
        self.status.projects.iter().find(|p| p.name == name)
    }

    /// Number of projects currently marked as running
    pub fn running_count(&self) -> usize {
        self.status
            .projects
            .iter()
            .filter(|p| p.status == ProjectState::Running)
            .count()
    }

    /// Webhook authentication settings, only when authentication is enabled
    pub fn webhook_authentication(&self) -> Option<&WebhookAuthentication> {
        self.spec
            .webhook
            .as_ref()
            .and_then(|w| w.authentication.as_ref())
            .filter(|a| a.enabled)
    }
}

/// Desired state of a renovate job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenovateJobSpec {
    /// Cron schedule in standard five-field format
    pub schedule: String,
    /// Runner image
    #[serde(default)]
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovery_filter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discover_topics: Option<String>,
    /// Secret holding the runner credentials, exposed as environment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_env: Vec<EnvVar>,
    /// Maximum number of projects running at the same time
    #[serde(default = "default_parallelism")]
    pub parallelism: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<serde_json::Value>,
    #[serde(default)]
    pub scheduling: SchedulingConstraints,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<ServiceAccountSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<WorkloadMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_context: Option<SecurityContextOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookSettings>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<String>,
}

fn default_parallelism() -> u32 {
    1
}

impl Default for RenovateJobSpec {
    fn default() -> Self {
        Self {
            schedule: String::new(),
            image: String::new(),
            discovery_filter: None,
            discover_topics: None,
            secret_ref: None,
            extra_env: Vec::new(),
            parallelism: default_parallelism(),
            resources: None,
            scheduling: SchedulingConstraints::default(),
            service_account: None,
            metadata: None,
            security_context: None,
            webhook: None,
            image_pull_secrets: Vec::new(),
        }
    }
}

/// Placement constraints, passed through to workloads untouched
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulingConstraints {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topology_spread_constraints: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAccountSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automount_service_account_token: Option<bool>,
}

/// Labels and annotations applied to every workload of the job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkloadMetadata {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityContextOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod: Option<PodSecurityContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerSecurityContext>,
}

/// Webhook trigger configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebhookSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<WebhookAuthentication>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAuthentication {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretKeyReference>,
}

/// Reference to a single key of a secret
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretKeyReference {
    pub name: String,
    pub key: String,
}

/// Observed state: project records in discovery order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RenovateJobStatus {
    #[serde(default)]
    pub projects: Vec<ProjectStatus>,
}
