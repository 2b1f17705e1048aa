//! Cron scheduler
//!
//! Runs named callbacks on cron expressions evaluated in UTC. Every schedule
//! is its own task: it sleeps until the next occurrence, runs the callback to
//! completion and only then computes the following occurrence, so runs of
//! one schedule never overlap.

use chrono::{DateTime, Utc};
use croner::Cron;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{OperatorError, Result};
use crate::health::{HealthCheck, ScheduleHealth};

/// Work started on every occurrence of a schedule
pub type ScheduleCallback = Arc<dyn Fn() -> ScheduledRun + Send + Sync>;

/// One run of a schedule's callback
pub type ScheduledRun = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Wraps an async closure as a schedule callback
pub fn schedule_callback<F, Fut>(f: F) -> ScheduleCallback
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move || -> ScheduledRun { Box::pin(f()) })
}

struct ScheduleEntry {
    expression: String,
    cancel: CancellationToken,
}

/// Named cron schedules
pub struct Scheduler {
    entries: Mutex<HashMap<String, ScheduleEntry>>,
    health: HealthCheck,
    shutdown: CancellationToken,
}

/// Next occurrence of `expression` strictly after `after`
///
/// `None` for expressions that do not parse or never fire again.
pub fn next_run(expression: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    parse(expression)
        .ok()?
        .find_next_occurrence(&after, false)
        .ok()
}

fn parse(expression: &str) -> Result<Cron> {
    Cron::new(expression)
        .parse()
        .map_err(|e| OperatorError::Schedule {
            expression: expression.to_string(),
            message: e.to_string(),
        })
}

impl Scheduler {
    /// Creates a scheduler whose schedules all stop with `shutdown`
    pub fn new(health: HealthCheck, shutdown: CancellationToken) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            health,
            shutdown,
        }
    }

    /// Marks the scheduler as running in the health snapshot
    pub fn start(&self) {
        self.health.update_scheduler(|h| h.running = true);
        info!("Scheduler started");
    }

    /// Stops every schedule
    ///
    /// Callbacks already running finish; no new occurrences start.
    pub fn stop(&self) {
        let entries: Vec<ScheduleEntry> = self.lock_entries().drain().map(|(_, e)| e).collect();
        for entry in &entries {
            entry.cancel.cancel();
        }

        self.health.update_scheduler(|h| {
            h.running = false;
            h.schedules.clear();
        });
        info!("Scheduler stopped ({} schedule(s) removed)", entries.len());
    }

    /// Adds a schedule
    ///
    /// # Arguments
    /// * `name` - Unique name of the schedule
    /// * `expression` - Cron expression, evaluated in UTC
    /// * `callback` - Work to run on every occurrence
    pub fn add_schedule(
        &self,
        name: &str,
        expression: &str,
        callback: ScheduleCallback,
    ) -> Result<()> {
        let cron = parse(expression)?;

        let mut entries = self.lock_entries();
        if entries.contains_key(name) {
            return Err(OperatorError::InvalidRequest(format!(
                "schedule {} already exists",
                name
            )));
        }

        let cancel = self.shutdown.child_token();
        entries.insert(
            name.to_string(),
            ScheduleEntry {
                expression: expression.to_string(),
                cancel: cancel.clone(),
            },
        );
        drop(entries);

        self.health.update_scheduler(|h| {
            h.schedules.insert(
                name.to_string(),
                ScheduleHealth {
                    name: name.to_string(),
                    expression: expression.to_string(),
                    next_run: cron.find_next_occurrence(&Utc::now(), false).ok(),
                    is_running: false,
                },
            );
        });

        tokio::spawn(run_schedule(
            name.to_string(),
            cron,
            callback,
            self.health.clone(),
            cancel,
        ));

        info!("Added schedule {} ({})", name, expression);
        Ok(())
    }

    /// Adds a schedule, replacing one of the same name
    ///
    /// Nothing changes when the existing schedule has the same expression.
    pub fn add_schedule_replace_existing(
        &self,
        name: &str,
        expression: &str,
        callback: ScheduleCallback,
    ) -> Result<()> {
        parse(expression)?;

        let unchanged = self
            .lock_entries()
            .get(name)
            .is_some_and(|e| e.expression == expression);
        if unchanged {
            debug!("Schedule {} unchanged", name);
            return Ok(());
        }

        self.remove_schedule(name);
        self.add_schedule(name, expression, callback)
    }

    /// Removes a schedule; unknown names are ignored
    pub fn remove_schedule(&self, name: &str) {
        let Some(entry) = self.lock_entries().remove(name) else {
            return;
        };
        entry.cancel.cancel();

        self.health.update_scheduler(|h| {
            h.schedules.remove(name);
        });
        info!("Removed schedule {}", name);
    }

    /// Next occurrence of a schedule
    pub fn next_run(&self, name: &str) -> Option<DateTime<Utc>> {
        let expression = self.lock_entries().get(name)?.expression.clone();
        next_run(&expression, Utc::now())
    }

    /// Names of all schedules
    pub fn names(&self) -> Vec<String> {
        self.lock_entries().keys().cloned().collect()
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, ScheduleEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Sleeps until each occurrence and runs the callback, until cancelled
async fn run_schedule(
    name: String,
    cron: Cron,
    callback: ScheduleCallback,
    health: HealthCheck,
    cancel: CancellationToken,
) {
    loop {
        let now = Utc::now();
        let next = match cron.find_next_occurrence(&now, false) {
            Ok(next) => next,
            Err(e) => {
                warn!("Schedule {} has no further occurrence: {}", name, e);
                break;
            }
        };
        set_schedule_health(&health, &name, |s| s.next_run = Some(next));

        let wait = (next - now).to_std().unwrap_or_default();
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = time::sleep(wait) => {}
        }

        debug!("Running schedule {}", name);
        set_schedule_health(&health, &name, |s| s.is_running = true);
        callback().await;
        set_schedule_health(&health, &name, |s| s.is_running = false);
    }

    debug!("Schedule {} stopped", name);
}

fn set_schedule_health(health: &HealthCheck, name: &str, f: impl FnOnce(&mut ScheduleHealth)) {
    health.update_scheduler(|h| {
        if let Some(schedule) = h.schedules.get_mut(name) {
            f(schedule);
        }
    });
}
