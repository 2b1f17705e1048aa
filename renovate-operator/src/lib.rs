//! Renovate Operator
//!
//! Runs Renovate for groups of repositories on a schedule.
//!
//! Architecture:
//! - Repositories: the remote store of renovate jobs, secrets and workloads
//! - Services: job state, discovery, workload templates, metrics, inbound operations
//! - Scheduler: cron schedules per job and the executor loop
//! - Reconciler: keeps the schedules in line with the renovate jobs

pub mod config;
pub mod error;
pub mod health;
pub mod locks;
pub mod manifest;
pub mod reconciler;
pub mod repository;
pub mod retry;
pub mod scheduler;
pub mod service;

pub use config::Config;
pub use error::{OperatorError, Result};
