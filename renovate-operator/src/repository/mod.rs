//! Repository layer
//!
//! Repositories abstract the remote store: renovate job resources, the
//! credentials they reference and the execution workloads launched for them.
//! They provide simple, focused interfaces without any business logic.
//!
//! All repositories are trait-based to enable testing with the in-memory
//! implementations.

mod podman;
mod secrets;
mod tenants;
mod workloads;

// Re-export traits
pub use secrets::SecretRepository;
pub use tenants::{TenantEvent, TenantRepository};
pub use workloads::WorkloadRepository;

// Re-export implementations
pub use podman::{LABEL_NAMESPACE, PodmanWorkloadRepository, check_podman_available};
pub use secrets::{InMemorySecretRepository, Secret};
pub use tenants::InMemoryTenantRepository;
pub use workloads::{InMemoryWorkloadRepository, ScriptedRun};

// Generation helpers
pub use workloads::{create_with_generation, find_latest};
