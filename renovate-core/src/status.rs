//! Project status state machine
//!
//! Legal transitions:
//!
//! | requested   | allowed from | effect on success                          |
//! |-------------|--------------|--------------------------------------------|
//! | `Scheduled` | not running  | status only                                |
//! | `Running`   | `Scheduled`  | status, stale duration cleared             |
//! | `Completed` | `Running`    | status, `last_run = now`                   |
//! | `Failed`    | `Running`    | status, `last_run = now`                   |
//!
//! A rejected transition leaves the status untouched. The payload is merged
//! either way: a provided result classification always replaces the stored
//! one, `Running` always clears the duration and the terminal requests
//! always take the payload duration.

use chrono::{DateTime, Utc};

use crate::domain::project::{ProjectState, ProjectStatus, StatusUpdate};

/// Applies a requested transition to a project record
pub fn apply_transition(
    mut project: ProjectStatus,
    update: &StatusUpdate,
    now: DateTime<Utc>,
) -> ProjectStatus {
    match update.status {
        ProjectState::Scheduled => {
            // a run in flight is never silently rescheduled
            if project.status != ProjectState::Running {
                project.status = ProjectState::Scheduled;
            }
        }
        ProjectState::Running => {
            if project.status == ProjectState::Scheduled {
                project.status = ProjectState::Running;
            }
            project.duration = None;
        }
        ProjectState::Completed | ProjectState::Failed => {
            if project.status == ProjectState::Running {
                project.status = update.status;
                project.last_run = now;
            }
            project.duration = update.duration.clone();
        }
    }

    if let Some(result_status) = &update.result_status {
        project.result_status = Some(result_status.clone());
    }

    project
}
