use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[cfg(any(test, feature = "testing"))]
use mockall::automock;

use crate::workflow::{Payload, WorkflowStep};

/// Result of asking a collaborator to render and validate a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    /// The user supplied everything the step needs
    Ready { payload: Payload },
    /// The step cannot be satisfied yet; nothing changes
    NotReady { reason: String },
    /// Hard failure; the step moves to `Error`
    Failed { reason: String },
}

/// Collaborator that owns step rendering and input validation. The engine
/// only sees the opaque payload it returns.
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn collect(&self, step: &WorkflowStep, form_data: &Payload) -> StepOutcome;
}

/// What `run_current_step` did with the collaborator's answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum StepRun {
    Advanced {
        step_id: String,
        current_step: Option<String>,
        finished: bool,
    },
    NotReady {
        step_id: String,
        reason: String,
    },
    Failed {
        step_id: String,
        reason: String,
    },
}

impl StepRun {
    pub fn step_id(&self) -> &str {
        match self {
            StepRun::Advanced { step_id, .. }
            | StepRun::NotReady { step_id, .. }
            | StepRun::Failed { step_id, .. } => step_id,
        }
    }
}
