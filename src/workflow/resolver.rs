//! Eligibility of steps given the current statuses of a workflow.

use super::registry::{StepRegistry, WorkflowStep};
use super::state::{StepStatus, WorkflowState};

/// Steps that may run next, in registry order.
///
/// A step is eligible when it is enabled for the workflow's mode, is not
/// completed, active or skipped, and every dependency is completed.
pub fn available_steps(registry: &StepRegistry, state: &WorkflowState) -> Vec<String> {
    registry
        .steps_for(state.mode)
        .filter(|step| {
            matches!(
                state.status_of(&step.id),
                Some(StepStatus::Pending) | Some(StepStatus::Error)
            )
        })
        .filter(|step| dependencies_met(state, step))
        .map(|step| step.id.clone())
        .collect()
}

pub fn next_step(registry: &StepRegistry, state: &WorkflowState) -> Option<String> {
    available_steps(registry, state).into_iter().next()
}

pub fn dependencies_met(state: &WorkflowState, step: &WorkflowStep) -> bool {
    step.depends_on
        .iter()
        .all(|dep| state.status_of(dep) == Some(StepStatus::Completed))
}

/// Dependencies of `step` that are not yet completed
pub fn unmet_dependencies(state: &WorkflowState, step: &WorkflowStep) -> Vec<String> {
    step.depends_on
        .iter()
        .filter(|dep| state.status_of(dep) != Some(StepStatus::Completed))
        .cloned()
        .collect()
}
