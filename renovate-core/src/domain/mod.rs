//! Core domain types
//!
//! These types mirror the declarative resource stored in the control plane
//! (the renovate job and its per-project status) and the ephemeral workloads
//! launched on its behalf.

pub mod job;
pub mod project;
pub mod workload;
