//! Service layer
//!
//! Business logic of the operator. Services orchestrate between the
//! repositories and hold the rules for project state, discovery and
//! workload construction.

pub mod discovery;
pub mod job_manager;
pub mod metrics;
pub mod operations;
pub mod templates;

// Re-export traits
pub use discovery::DiscoveryAgent;
pub use job_manager::JobManager;
pub use metrics::MetricsSink;
pub use templates::WorkloadTemplates;

// Re-export implementations
pub use discovery::{DiscoverySettings, StandardDiscoveryAgent};
pub use job_manager::StandardJobManager;
pub use metrics::InMemoryMetrics;
pub use operations::{Operations, TenantOverview, WebhookCredentials};
pub use templates::{StandardWorkloadTemplates, TemplateSettings};
