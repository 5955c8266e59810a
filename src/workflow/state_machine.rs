use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::registry::{RegistryError, StepRegistry, WorkflowStep};
use super::resolver::{next_step, unmet_dependencies};
use super::state::{Payload, ProgressInfo, StepStatus, WorkflowMode, WorkflowState};
use crate::behavior::UserBehaviorProfile;
use crate::persistence::PersistenceError;

/// Errors that can occur while driving a workflow
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Workflow not found: {workflow_id}")]
    NotFound { workflow_id: String },

    #[error("Unknown step: {step_id}")]
    UnknownStep { step_id: String },

    #[error("Step {step_id} is not enabled in {mode} mode")]
    StepDisabled { step_id: String, mode: WorkflowMode },

    #[error("Step {step_id} has unmet dependencies: {missing:?}")]
    DependencyUnmet { step_id: String, missing: Vec<String> },

    #[error("Step {step_id} is required and cannot be skipped")]
    StepNotSkippable { step_id: String },

    #[error("Step {step_id} cannot {action} while {status:?}")]
    InvalidTransition {
        step_id: String,
        action: &'static str,
        status: StepStatus,
    },

    #[error("Workflow {workflow_id} has no current step")]
    NoCurrentStep { workflow_id: String },

    #[error("Workflow {workflow_id} is already finished")]
    WorkflowFinished { workflow_id: String },

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

impl From<RegistryError> for WorkflowError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound { step_id } => WorkflowError::UnknownStep { step_id },
            other => WorkflowError::UnknownStep {
                step_id: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitionKind {
    Advanced,
    /// Payload re-merged into an already completed step
    Readvanced,
    Jumped,
    Skipped,
    Failed,
    NoOp,
}

/// What a successful transition did, consumed by behavior tracking and auto-save
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub step_id: String,
    pub kind: TransitionKind,
    /// Time the step spent active before completing
    pub duration_seconds: Option<f64>,
    pub current_step: Option<String>,
    /// True when this transition finished the workflow
    pub finished: bool,
}

/// Mutation rules for `WorkflowState`, parameterized by the step catalog.
///
/// Every operation validates before it mutates, so an `Err` always leaves the
/// state untouched.
#[derive(Debug, Clone, Copy)]
pub struct WorkflowMachine<'a> {
    registry: &'a StepRegistry,
}

impl<'a> WorkflowMachine<'a> {
    pub fn new(registry: &'a StepRegistry) -> Self {
        Self { registry }
    }

    /// Initialize a workflow with every enabled step pending and the first
    /// eligible one active. A mode with no enabled steps yields a workflow that
    /// is finished from the start.
    pub fn create(&self, user_id: &str, mode: WorkflowMode, auto_save_enabled: bool, now: DateTime<Utc>) -> WorkflowState {
        let mut state = WorkflowState {
            workflow_id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            mode,
            current_step: None,
            step_status: self
                .registry
                .steps_for(mode)
                .map(|step| (step.id.clone(), StepStatus::Pending))
                .collect(),
            step_data: BTreeMap::new(),
            form_data: Payload::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
            auto_save_enabled,
            active_since: None,
            step_errors: BTreeMap::new(),
        };

        self.promote_next(&mut state, now);
        self.check_completion(&mut state, now);

        info!(
            workflow.id = %state.workflow_id,
            user.id = %state.user_id,
            mode = %mode,
            steps = state.step_status.len(),
            current_step = ?state.current_step,
            "Workflow created"
        );

        state
    }

    pub fn advance(
        &self,
        state: &mut WorkflowState,
        step_id: &str,
        payload: Payload,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, WorkflowError> {
        let (step, status) = self.enabled_step(state, step_id)?;

        if status == StepStatus::Completed {
            merge_payload(state, step_id, payload);
            state.updated_at = now;
            debug!(workflow.id = %state.workflow_id, step.id = %step_id, "Re-merged completed step payload");
            return Ok(self.outcome(state, step_id, TransitionKind::Readvanced, None, false));
        }

        self.ensure_not_finished(state)?;
        let missing = unmet_dependencies(state, step);
        if !missing.is_empty() {
            return Err(WorkflowError::DependencyUnmet {
                step_id: step_id.to_string(),
                missing,
            });
        }

        let duration_seconds = match status {
            StepStatus::Active => state
                .active_since
                .map(|since| (now - since).num_milliseconds().max(0) as f64 / 1000.0),
            _ => None,
        };

        merge_payload(state, step_id, payload);
        state.step_status.insert(step_id.to_string(), StepStatus::Completed);
        state.step_errors.remove(step_id);

        let was_current = state.current_step.as_deref() == Some(step_id);
        if was_current || state.current_step.is_none() {
            self.promote_next(state, now);
        }
        state.updated_at = now;
        let finished = self.check_completion(state, now);

        let outcome = self.outcome(state, step_id, TransitionKind::Advanced, duration_seconds, finished);
        self.record_transition(state, &outcome);
        Ok(outcome)
    }

    /// Make `step_id` the active step out of order. Only dependency
    /// satisfaction is enforced; the previously active step returns to pending
    /// with its data kept.
    pub fn jump(&self, state: &mut WorkflowState, step_id: &str, now: DateTime<Utc>) -> Result<TransitionOutcome, WorkflowError> {
        let (step, status) = self.enabled_step(state, step_id)?;
        self.ensure_not_finished(state)?;

        match status {
            StepStatus::Active => {
                return Ok(self.outcome(state, step_id, TransitionKind::NoOp, None, false));
            }
            StepStatus::Completed => {
                return Err(WorkflowError::InvalidTransition {
                    step_id: step_id.to_string(),
                    action: "jump",
                    status,
                });
            }
            StepStatus::Pending | StepStatus::Skipped | StepStatus::Error => {}
        }

        let missing = unmet_dependencies(state, step);
        if !missing.is_empty() {
            return Err(WorkflowError::DependencyUnmet {
                step_id: step_id.to_string(),
                missing,
            });
        }

        if let Some(previous) = state.active_step().map(str::to_string) {
            state.step_status.insert(previous, StepStatus::Pending);
        }
        self.activate(state, step_id, now);
        state.updated_at = now;

        let outcome = self.outcome(state, step_id, TransitionKind::Jumped, None, false);
        self.record_transition(state, &outcome);
        Ok(outcome)
    }

    /// Skip an optional step. Pending optional steps that depend on it are
    /// skipped along with it, since they can no longer complete.
    pub fn skip(&self, state: &mut WorkflowState, step_id: &str, now: DateTime<Utc>) -> Result<TransitionOutcome, WorkflowError> {
        let (step, status) = self.enabled_step(state, step_id)?;

        if step.required {
            return Err(WorkflowError::StepNotSkippable {
                step_id: step_id.to_string(),
            });
        }
        self.ensure_not_finished(state)?;

        match status {
            StepStatus::Skipped => {
                return Ok(self.outcome(state, step_id, TransitionKind::NoOp, None, false));
            }
            StepStatus::Completed => {
                return Err(WorkflowError::InvalidTransition {
                    step_id: step_id.to_string(),
                    action: "skip",
                    status,
                });
            }
            StepStatus::Pending | StepStatus::Active | StepStatus::Error => {}
        }

        let mut skipped = vec![step_id.to_string()];
        let mut cursor = 0;
        while cursor < skipped.len() {
            let parent = skipped[cursor].clone();
            state.step_status.insert(parent.clone(), StepStatus::Skipped);
            state.step_errors.remove(&parent);
            for dependent in self.registry.steps_for(state.mode) {
                if dependent.depends_on.contains(&parent)
                    && !dependent.required
                    && !state.status_of(&dependent.id).is_some_and(|s| s.is_settled())
                    && !skipped.contains(&dependent.id)
                {
                    skipped.push(dependent.id.clone());
                }
            }
            cursor += 1;
        }

        let current_skipped = state
            .current_step
            .as_ref()
            .is_some_and(|current| skipped.contains(current));
        if current_skipped || state.current_step.is_none() {
            self.promote_next(state, now);
        }
        state.updated_at = now;
        let finished = self.check_completion(state, now);

        if skipped.len() > 1 {
            debug!(
                workflow.id = %state.workflow_id,
                step.id = %step_id,
                cascaded = ?&skipped[1..],
                "Skipped dependent optional steps"
            );
        }

        let outcome = self.outcome(state, step_id, TransitionKind::Skipped, None, finished);
        self.record_transition(state, &outcome);
        Ok(outcome)
    }

    /// Record a hard failure reported for the active step. The step stays
    /// active and current so it can be retried with `advance`; only the
    /// reason is kept, in `step_errors`. A repeated failure replaces it.
    pub fn fail(
        &self,
        state: &mut WorkflowState,
        step_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, WorkflowError> {
        let (_, status) = self.enabled_step(state, step_id)?;
        self.ensure_not_finished(state)?;

        if status != StepStatus::Active {
            return Err(WorkflowError::InvalidTransition {
                step_id: step_id.to_string(),
                action: "fail",
                status,
            });
        }

        state.step_errors.insert(step_id.to_string(), reason.to_string());
        state.updated_at = now;

        warn!(
            workflow.id = %state.workflow_id,
            step.id = %step_id,
            reason = %reason,
            "Workflow step failed"
        );

        Ok(self.outcome(state, step_id, TransitionKind::Failed, None, false))
    }

    /// Progress over the steps enabled for the workflow's mode. Skipped steps
    /// are left out of the total. The remaining-time estimate prefers the
    /// user's historical average for a step over the catalog estimate.
    pub fn progress(&self, state: &WorkflowState, profile: Option<&UserBehaviorProfile>) -> ProgressInfo {
        let completed_steps = state.count(StepStatus::Completed);
        let skipped_steps = state.count(StepStatus::Skipped);
        let total_steps = state.step_status.len() - skipped_steps;

        let estimated_remaining_seconds = state
            .step_status
            .iter()
            .filter(|(_, status)| !status.is_settled())
            .map(|(step_id, _)| {
                profile
                    .and_then(|p| p.average_step_seconds.get(step_id).copied())
                    .or_else(|| self.registry.get(step_id).ok().map(|s| s.estimated_seconds as f64))
                    .unwrap_or(0.0)
            })
            .sum();

        ProgressInfo {
            total_steps,
            completed_steps,
            skipped_steps,
            pending_steps: total_steps - completed_steps,
            current_step: state.current_step.clone(),
            percentage: state.progress_percentage(),
            estimated_remaining_seconds,
        }
    }

    fn enabled_step(&self, state: &WorkflowState, step_id: &str) -> Result<(&'a WorkflowStep, StepStatus), WorkflowError> {
        let step = self.registry.get(step_id)?;
        match state.status_of(step_id) {
            Some(status) => Ok((step, status)),
            None => Err(WorkflowError::StepDisabled {
                step_id: step_id.to_string(),
                mode: state.mode,
            }),
        }
    }

    fn ensure_not_finished(&self, state: &WorkflowState) -> Result<(), WorkflowError> {
        if state.is_finished() {
            return Err(WorkflowError::WorkflowFinished {
                workflow_id: state.workflow_id.clone(),
            });
        }
        Ok(())
    }

    fn activate(&self, state: &mut WorkflowState, step_id: &str, now: DateTime<Utc>) {
        state.step_status.insert(step_id.to_string(), StepStatus::Active);
        state.current_step = Some(step_id.to_string());
        state.active_since = Some(now);
    }

    /// Point the workflow at the first eligible step, or at nothing
    fn promote_next(&self, state: &mut WorkflowState, now: DateTime<Utc>) {
        match next_step(self.registry, state) {
            Some(next) => self.activate(state, &next, now),
            None => {
                state.current_step = None;
                state.active_since = None;
            }
        }
    }

    /// Returns true when this call finished the workflow
    fn check_completion(&self, state: &mut WorkflowState, now: DateTime<Utc>) -> bool {
        if state.completed_at.is_some() {
            return false;
        }
        if state.step_status.values().all(StepStatus::is_settled) {
            state.completed_at = Some(now);
            state.current_step = None;
            state.active_since = None;
            info!(
                workflow.id = %state.workflow_id,
                user.id = %state.user_id,
                "Workflow finished"
            );
            return true;
        }
        false
    }

    fn outcome(
        &self,
        state: &WorkflowState,
        step_id: &str,
        kind: TransitionKind,
        duration_seconds: Option<f64>,
        finished: bool,
    ) -> TransitionOutcome {
        TransitionOutcome {
            step_id: step_id.to_string(),
            kind,
            duration_seconds,
            current_step: state.current_step.clone(),
            finished,
        }
    }

    fn record_transition(&self, state: &WorkflowState, outcome: &TransitionOutcome) {
        info!(
            workflow.id = %state.workflow_id,
            step.id = %outcome.step_id,
            kind = ?outcome.kind,
            current_step = ?outcome.current_step,
            duration_seconds = ?outcome.duration_seconds,
            finished = outcome.finished,
            "Workflow step transition"
        );
    }
}

/// Store the payload for the step and fold it into the cumulative form data.
/// A re-submitted step replaces its previous payload.
fn merge_payload(state: &mut WorkflowState, step_id: &str, payload: Payload) {
    for (key, value) in &payload {
        state.form_data.insert(key.clone(), value.clone());
    }
    state.step_data.insert(step_id.to_string(), payload);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn abc_registry() -> StepRegistry {
        let mut registry = StepRegistry::new();
        registry.register(WorkflowStep::new("a", "A").with_estimated_seconds(10)).unwrap();
        registry
            .register(WorkflowStep::new("b", "B").with_dependencies(["a"]).with_estimated_seconds(20))
            .unwrap();
        registry
            .register(
                WorkflowStep::new("c", "C")
                    .optional()
                    .with_dependencies(["a"])
                    .with_estimated_seconds(30),
            )
            .unwrap();
        registry
    }

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_create_activates_first_step() {
        let registry = abc_registry();
        let machine = WorkflowMachine::new(&registry);
        let state = machine.create("user", WorkflowMode::Guided, true, Utc::now());

        assert_eq!(state.current_step.as_deref(), Some("a"));
        assert_eq!(state.status_of("a"), Some(StepStatus::Active));
        assert_eq!(state.status_of("b"), Some(StepStatus::Pending));
        assert_eq!(state.step_status.len(), 3);
        assert!(state.completed_at.is_none());
    }

    #[test]
    fn test_create_with_no_enabled_steps_is_finished() {
        let mut registry = StepRegistry::new();
        registry
            .register(WorkflowStep::new("only", "Only").with_modes(&[WorkflowMode::Advanced]))
            .unwrap();
        let machine = WorkflowMachine::new(&registry);
        let state = machine.create("user", WorkflowMode::Quick, true, Utc::now());

        assert!(state.step_status.is_empty());
        assert!(state.current_step.is_none());
        assert_eq!(state.completed_at, Some(state.created_at));
    }

    #[test]
    fn test_advance_promotes_next_in_registry_order() {
        let registry = abc_registry();
        let machine = WorkflowMachine::new(&registry);
        let start = Utc::now();
        let mut state = machine.create("user", WorkflowMode::Guided, true, start);

        let outcome = machine
            .advance(&mut state, "a", payload(json!({"name": "x"})), start + Duration::seconds(12))
            .unwrap();

        assert_eq!(outcome.kind, TransitionKind::Advanced);
        assert_eq!(outcome.duration_seconds, Some(12.0));
        assert_eq!(state.status_of("a"), Some(StepStatus::Completed));
        assert_eq!(state.status_of("b"), Some(StepStatus::Active));
        assert_eq!(state.status_of("c"), Some(StepStatus::Pending));
        assert_eq!(state.current_step.as_deref(), Some("b"));
        assert_eq!(state.form_data.get("name"), Some(&json!("x")));
    }

    #[test]
    fn test_advance_with_unmet_dependencies_does_not_mutate() {
        let registry = abc_registry();
        let machine = WorkflowMachine::new(&registry);
        let mut state = machine.create("user", WorkflowMode::Guided, true, Utc::now());
        let before = state.clone();

        let err = machine.advance(&mut state, "b", Payload::new(), Utc::now()).unwrap_err();
        assert!(matches!(err, WorkflowError::DependencyUnmet { ref missing, .. } if missing == &vec!["a".to_string()]));
        assert_eq!(state, before);
    }

    #[test]
    fn test_readvance_completed_step_only_merges() {
        let registry = abc_registry();
        let machine = WorkflowMachine::new(&registry);
        let mut state = machine.create("user", WorkflowMode::Guided, true, Utc::now());

        machine.advance(&mut state, "a", payload(json!({"k": 1})), Utc::now()).unwrap();
        let statuses = state.step_status.clone();
        let outcome = machine.advance(&mut state, "a", payload(json!({"k": 2})), Utc::now()).unwrap();

        assert_eq!(outcome.kind, TransitionKind::Readvanced);
        assert_eq!(state.step_status, statuses);
        assert_eq!(state.current_step.as_deref(), Some("b"));
        assert_eq!(state.form_data.get("k"), Some(&json!(2)));
        assert_eq!(state.step_data["a"].get("k"), Some(&json!(2)));
    }

    #[test]
    fn test_jump_requires_dependencies() {
        let registry = abc_registry();
        let machine = WorkflowMachine::new(&registry);
        let mut state = machine.create("user", WorkflowMode::Guided, true, Utc::now());
        let before = state.clone();

        assert!(matches!(
            machine.jump(&mut state, "c", Utc::now()),
            Err(WorkflowError::DependencyUnmet { .. })
        ));
        assert_eq!(state, before);
    }

    #[test]
    fn test_jump_demotes_previous_active_step() {
        let registry = abc_registry();
        let machine = WorkflowMachine::new(&registry);
        let mut state = machine.create("user", WorkflowMode::Guided, true, Utc::now());
        machine.advance(&mut state, "a", Payload::new(), Utc::now()).unwrap();

        let outcome = machine.jump(&mut state, "c", Utc::now()).unwrap();

        assert_eq!(outcome.kind, TransitionKind::Jumped);
        assert_eq!(state.status_of("b"), Some(StepStatus::Pending));
        assert_eq!(state.status_of("c"), Some(StepStatus::Active));
        assert_eq!(state.current_step.as_deref(), Some("c"));
        assert_eq!(state.count(StepStatus::Active), 1);
    }

    #[test]
    fn test_jump_to_completed_step_is_rejected() {
        let registry = abc_registry();
        let machine = WorkflowMachine::new(&registry);
        let mut state = machine.create("user", WorkflowMode::Guided, true, Utc::now());
        machine.advance(&mut state, "a", Payload::new(), Utc::now()).unwrap();

        assert!(matches!(
            machine.jump(&mut state, "a", Utc::now()),
            Err(WorkflowError::InvalidTransition { action: "jump", .. })
        ));
    }

    #[test]
    fn test_skip_required_step_fails() {
        let registry = abc_registry();
        let machine = WorkflowMachine::new(&registry);
        let mut state = machine.create("user", WorkflowMode::Guided, true, Utc::now());
        let before = state.clone();

        assert!(matches!(
            machine.skip(&mut state, "a", Utc::now()),
            Err(WorkflowError::StepNotSkippable { .. })
        ));
        assert_eq!(state, before);
    }

    #[test]
    fn test_skip_non_current_optional_step_keeps_current() {
        let registry = abc_registry();
        let machine = WorkflowMachine::new(&registry);
        let mut state = machine.create("user", WorkflowMode::Guided, true, Utc::now());
        machine.advance(&mut state, "a", Payload::new(), Utc::now()).unwrap();

        machine.skip(&mut state, "c", Utc::now()).unwrap();

        assert_eq!(state.status_of("c"), Some(StepStatus::Skipped));
        assert_eq!(state.current_step.as_deref(), Some("b"));
        assert_eq!(state.status_of("b"), Some(StepStatus::Active));
    }

    #[test]
    fn test_skip_current_step_promotes_next() {
        let registry = abc_registry();
        let machine = WorkflowMachine::new(&registry);
        let mut state = machine.create("user", WorkflowMode::Guided, true, Utc::now());
        machine.advance(&mut state, "a", Payload::new(), Utc::now()).unwrap();
        machine.jump(&mut state, "c", Utc::now()).unwrap();

        machine.skip(&mut state, "c", Utc::now()).unwrap();

        assert_eq!(state.current_step.as_deref(), Some("b"));
        assert_eq!(state.status_of("b"), Some(StepStatus::Active));
    }

    #[test]
    fn test_skip_cascades_to_optional_dependents() {
        let mut registry = StepRegistry::new();
        registry.register(WorkflowStep::new("root", "Root")).unwrap();
        registry.register(WorkflowStep::new("extra", "Extra").optional()).unwrap();
        registry
            .register(WorkflowStep::new("extra_more", "More").optional().with_dependencies(["extra"]))
            .unwrap();
        let machine = WorkflowMachine::new(&registry);
        let mut state = machine.create("user", WorkflowMode::Quick, true, Utc::now());

        machine.skip(&mut state, "extra", Utc::now()).unwrap();

        assert_eq!(state.status_of("extra_more"), Some(StepStatus::Skipped));
        assert_eq!(state.current_step.as_deref(), Some("root"));
    }

    #[test]
    fn test_completion_and_finished_guard() {
        let registry = abc_registry();
        let machine = WorkflowMachine::new(&registry);
        let mut state = machine.create("user", WorkflowMode::Guided, true, Utc::now());

        machine.advance(&mut state, "a", Payload::new(), Utc::now()).unwrap();
        machine.advance(&mut state, "b", Payload::new(), Utc::now()).unwrap();
        let outcome = machine.skip(&mut state, "c", Utc::now()).unwrap();

        assert!(outcome.finished);
        assert!(state.completed_at.is_some());
        assert!(state.current_step.is_none());
        assert_eq!(machine.progress(&state, None).percentage, 100.0);

        assert!(matches!(
            machine.jump(&mut state, "c", Utc::now()),
            Err(WorkflowError::WorkflowFinished { .. })
        ));
        // re-merging data into a completed step is still allowed
        machine.advance(&mut state, "b", payload(json!({"late": true})), Utc::now()).unwrap();
        assert_eq!(state.form_data.get("late"), Some(&json!(true)));
    }

    #[test]
    fn test_fail_keeps_step_active_until_retried() {
        let registry = abc_registry();
        let machine = WorkflowMachine::new(&registry);
        let start = Utc::now();
        let mut state = machine.create("user", WorkflowMode::Guided, true, start);

        machine.fail(&mut state, "a", "upload rejected", start).unwrap();
        assert_eq!(state.status_of("a"), Some(StepStatus::Active));
        assert_eq!(state.current_step.as_deref(), Some("a"));
        assert_eq!(state.step_errors.get("a").map(String::as_str), Some("upload rejected"));
        assert!(state.completed_at.is_none());

        machine.fail(&mut state, "a", "again", start).unwrap();
        assert_eq!(state.step_errors.get("a").map(String::as_str), Some("again"));
        assert!(matches!(
            machine.fail(&mut state, "b", "not active", start),
            Err(WorkflowError::InvalidTransition { action: "fail", .. })
        ));

        let outcome = machine
            .advance(&mut state, "a", Payload::new(), start + Duration::seconds(4))
            .unwrap();
        assert_eq!(outcome.duration_seconds, Some(4.0));
        assert_eq!(state.status_of("a"), Some(StepStatus::Completed));
        assert!(state.step_errors.is_empty());
        assert_eq!(state.current_step.as_deref(), Some("b"));
    }

    #[test]
    fn test_failing_the_only_step_keeps_workflow_open() {
        let mut registry = StepRegistry::new();
        registry.register(WorkflowStep::new("only", "Only")).unwrap();
        let machine = WorkflowMachine::new(&registry);
        let mut state = machine.create("user", WorkflowMode::Quick, true, Utc::now());

        machine.fail(&mut state, "only", "printer offline", Utc::now()).unwrap();

        assert_eq!(state.current_step.as_deref(), Some("only"));
        assert_eq!(state.count(StepStatus::Active), 1);
        assert!(state.completed_at.is_none());
        assert_eq!(state.step_errors["only"], "printer offline");
    }

    #[test]
    fn test_disabled_step_is_rejected() {
        let registry = StepRegistry::certificate_catalog().unwrap();
        let machine = WorkflowMachine::new(&registry);
        let mut state = machine.create("user", WorkflowMode::Quick, true, Utc::now());

        assert!(matches!(
            machine.jump(&mut state, "customize_design", Utc::now()),
            Err(WorkflowError::StepDisabled { .. })
        ));
        assert!(matches!(
            machine.advance(&mut state, "nope", Payload::new(), Utc::now()),
            Err(WorkflowError::UnknownStep { .. })
        ));
    }

    #[test]
    fn test_progress_estimate_prefers_history() {
        let registry = abc_registry();
        let machine = WorkflowMachine::new(&registry);
        let mut state = machine.create("user", WorkflowMode::Guided, true, Utc::now());
        machine.advance(&mut state, "a", Payload::new(), Utc::now()).unwrap();

        let mut profile = UserBehaviorProfile::new("user", Utc::now());
        profile.average_step_seconds.insert("b".to_string(), 5.0);

        let without = machine.progress(&state, None);
        assert_eq!(without.estimated_remaining_seconds, 50.0);
        let with = machine.progress(&state, Some(&profile));
        assert_eq!(with.estimated_remaining_seconds, 35.0);
        assert_eq!(with.completed_steps, 1);
        assert_eq!(with.pending_steps, 2);
        assert_eq!(with.total_steps, 3);
    }
}
