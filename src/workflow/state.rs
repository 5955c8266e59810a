use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Opaque key-value payload captured from a step
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Path through the catalog: which steps are exposed to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowMode {
    Quick,
    Guided,
    Advanced,
}

impl WorkflowMode {
    pub const ALL: [WorkflowMode; 3] = [WorkflowMode::Quick, WorkflowMode::Guided, WorkflowMode::Advanced];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowMode::Quick => "quick",
            WorkflowMode::Guided => "guided",
            WorkflowMode::Advanced => "advanced",
        }
    }
}

impl fmt::Display for WorkflowMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown workflow mode: {0} (expected quick, guided or advanced)")]
pub struct ParseModeError(pub String);

impl FromStr for WorkflowMode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "quick" => Ok(WorkflowMode::Quick),
            "guided" => Ok(WorkflowMode::Guided),
            "advanced" => Ok(WorkflowMode::Advanced),
            _ => Err(ParseModeError(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Active,
    Completed,
    Skipped,
    /// Not assigned by transitions, which keep a failed step active. Records
    /// that carry it still load, and such a step is retried like a pending one.
    Error,
}

impl StepStatus {
    /// Completed and skipped steps need no further work
    pub fn is_settled(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Skipped)
    }
}

/// Mutable state of one running workflow instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_id: String,
    pub user_id: String,
    pub mode: WorkflowMode,
    pub current_step: Option<String>,
    pub step_status: BTreeMap<String, StepStatus>,
    pub step_data: BTreeMap<String, Payload>,
    pub form_data: Payload,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub auto_save_enabled: bool,
    /// When the current step became active, used for step timing
    #[serde(default)]
    pub active_since: Option<DateTime<Utc>>,
    /// Last failure reported for a step, cleared once it completes or is skipped
    #[serde(default)]
    pub step_errors: BTreeMap<String, String>,
}

impl WorkflowState {
    pub fn status_of(&self, step_id: &str) -> Option<StepStatus> {
        self.step_status.get(step_id).copied()
    }

    pub fn count(&self, status: StepStatus) -> usize {
        self.step_status.values().filter(|s| **s == status).count()
    }

    pub fn active_step(&self) -> Option<&str> {
        self.step_status
            .iter()
            .find(|(_, status)| **status == StepStatus::Active)
            .map(|(id, _)| id.as_str())
    }

    pub fn is_finished(&self) -> bool {
        self.completed_at.is_some()
    }

    /// Completed share of non-skipped steps, 100 when nothing is left to count
    pub fn progress_percentage(&self) -> f64 {
        let completed = self.count(StepStatus::Completed);
        let total = self.step_status.len() - self.count(StepStatus::Skipped);
        if total == 0 {
            100.0
        } else {
            completed as f64 / total as f64 * 100.0
        }
    }

    pub fn summary(&self) -> WorkflowSummary {
        WorkflowSummary {
            workflow_id: self.workflow_id.clone(),
            user_id: self.user_id.clone(),
            mode: self.mode,
            current_step: self.current_step.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
            progress: self.progress_percentage(),
            completed: self.is_finished(),
        }
    }
}

/// Listing entry for a user's workflows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub workflow_id: String,
    pub user_id: String,
    pub mode: WorkflowMode,
    pub current_step: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: f64,
    pub completed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressInfo {
    pub total_steps: usize,
    pub completed_steps: usize,
    pub skipped_steps: usize,
    pub pending_steps: usize,
    pub current_step: Option<String>,
    pub percentage: f64,
    pub estimated_remaining_seconds: f64,
}
