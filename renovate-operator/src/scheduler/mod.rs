//! Scheduler layer
//!
//! The two timers of the operator: cron schedules that run discovery per
//! tenant, and the executor loop that launches and checks project runs.

pub mod cron;
pub mod executor;

pub use cron::{ScheduleCallback, Scheduler, next_run, schedule_callback};
pub use executor::{Executor, ExecutorSettings};
