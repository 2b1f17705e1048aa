//! Project status types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a project within a renovate job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectState {
    Scheduled,
    Running,
    Completed,
    Failed,
}

impl ProjectState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectState::Scheduled => "scheduled",
            ProjectState::Running => "running",
            ProjectState::Completed => "completed",
            ProjectState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProjectState::Completed | ProjectState::Failed)
    }
}

impl fmt::Display for ProjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing a status string that is not one of the four states
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown project status: {0}")]
pub struct UnknownProjectState(pub String);

impl FromStr for ProjectState {
    type Err = UnknownProjectState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "scheduled" => Ok(ProjectState::Scheduled),
            "running" => Ok(ProjectState::Running),
            "completed" => Ok(ProjectState::Completed),
            "failed" => Ok(ProjectState::Failed),
            _ => Err(UnknownProjectState(s.to_string())),
        }
    }
}

/// Status record of a single discovered project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectStatus {
    pub name: String,
    pub status: ProjectState,
    pub last_run: DateTime<Utc>,
    /// Human readable duration of the last run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    /// Classification of the last run, e.g. "No Config"
    #[serde(
        default,
        rename = "renovateResultStatus",
        skip_serializing_if = "Option::is_none"
    )]
    pub result_status: Option<String>,
}

impl ProjectStatus {
    /// A freshly discovered project, waiting for its first run
    pub fn scheduled(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: ProjectState::Scheduled,
            last_run: Utc::now(),
            duration: None,
            result_status: None,
        }
    }
}

/// A requested transition plus the payload merged into the record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: ProjectState,
    pub result_status: Option<String>,
    pub duration: Option<String>,
}

impl StatusUpdate {
    pub fn new(status: ProjectState) -> Self {
        Self {
            status,
            result_status: None,
            duration: None,
        }
    }

    pub fn with_result_status(mut self, result_status: Option<String>) -> Self {
        self.result_status = result_status;
        self
    }

    pub fn with_duration(mut self, duration: Option<String>) -> Self {
        self.duration = duration;
        self
    }
}

impl From<ProjectState> for StatusUpdate {
    fn from(status: ProjectState) -> Self {
        Self::new(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trips_through_strings() {
        for state in [
            ProjectState::Scheduled,
            ProjectState::Running,
            ProjectState::Completed,
            ProjectState::Failed,
        ] {
            assert_eq!(state.as_str().parse::<ProjectState>().unwrap(), state);
        }
        assert!("paused".parse::<ProjectState>().is_err());
    }

    #[test]
    fn test_project_status_serializes_camel_case() {
        let mut project = ProjectStatus::scheduled("org/a");
        project.result_status = Some("No Config".to_string());

        let value = serde_json::to_value(&project).unwrap();
        assert_eq!(value["status"], "scheduled");
        assert_eq!(value["renovateResultStatus"], "No Config");
        assert!(value.get("lastRun").is_some());
        assert!(value.get("duration").is_none());
    }
}
