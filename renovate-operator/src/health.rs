//! Health model
//!
//! A shared snapshot of what the scheduler and the executor are doing,
//! written by those components and read by whoever serves health checks.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleHealth {
    pub name: String,
    pub expression: String,
    pub next_run: Option<DateTime<Utc>>,
    pub is_running: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchedulerHealth {
    pub running: bool,
    pub schedules: BTreeMap<String, ScheduleHealth>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantExecutionHealth {
    pub is_running: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutorHealth {
    pub running: bool,
    pub tenants: BTreeMap<String, TenantExecutionHealth>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub scheduler: SchedulerHealth,
    pub executor: ExecutorHealth,
}

/// Cloneable handle to the shared health snapshot
#[derive(Debug, Clone, Default)]
pub struct HealthCheck {
    inner: Arc<RwLock<HealthSnapshot>>,
}

impl HealthCheck {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_scheduler(&self, f: impl FnOnce(&mut SchedulerHealth)) {
        let mut snapshot = self.inner.write().unwrap_or_else(|e| e.into_inner());
        f(&mut snapshot.scheduler);
    }

    pub fn update_executor(&self, f: impl FnOnce(&mut ExecutorHealth)) {
        let mut snapshot = self.inner.write().unwrap_or_else(|e| e.into_inner());
        f(&mut snapshot.executor);
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Both loops are up
    pub fn is_healthy(&self) -> bool {
        let snapshot = self.snapshot();
        snapshot.scheduler.running && snapshot.executor.running
    }
}
