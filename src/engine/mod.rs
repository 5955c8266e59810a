//! Session-facing workflow engine.
//!
//! The engine owns every live `WorkflowState` behind a per-workflow writer
//! lock and publishes a snapshot after each mutation. Readers (progress,
//! listings, dashboards) only ever touch the snapshots, so they never wait on
//! a workflow that is being edited.

pub mod handler;

pub use handler::{StepHandler, StepOutcome, StepRun};

use chrono::{DateTime, Utc};
use moka::future::Cache;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, error, info, warn, Instrument};

use crate::behavior::{self, BehaviorConfig, BehaviorTracker, Suggestions, UserBehaviorProfile, Widget};
use crate::config::FlexflowConfig;
use crate::persistence::{
    AutoSaveScheduler, FileSystemStore, PersistenceError, ProfileStore, SaveReason, WorkflowPersistence,
};
use crate::telemetry::create_workflow_span;
use crate::workflow::{
    available_steps, Payload, ProgressInfo, RegistryError, StepRegistry, TransitionKind,
    TransitionOutcome, WorkflowError, WorkflowMachine, WorkflowMode, WorkflowState, WorkflowSummary,
};

struct WorkflowSlot {
    /// Serializes mutations and saves of one workflow
    writer: Arc<Mutex<WorkflowState>>,
    snapshot: RwLock<WorkflowState>,
    /// Set once a finished workflow is saved and dropped from the live map.
    /// Holders of a stale handle reload from the store.
    retired: AtomicBool,
}

impl WorkflowSlot {
    fn new(state: WorkflowState) -> Arc<Self> {
        Arc::new(Self {
            writer: Arc::new(Mutex::new(state.clone())),
            snapshot: RwLock::new(state),
            retired: AtomicBool::new(false),
        })
    }

    async fn read(&self) -> WorkflowState {
        self.snapshot.read().await.clone()
    }
}

const GATE_CAPACITY: u64 = 100_000;
const GATE_IDLE_SECONDS: u64 = 30 * 60;

pub struct WorkflowEngine {
    registry: Arc<StepRegistry>,
    store: Arc<dyn WorkflowPersistence>,
    profiles: Arc<dyn ProfileStore>,
    tracker: BehaviorTracker,
    auto_save: AutoSaveScheduler,
    /// Unfinished workflows, plus finished ones whose last change is not saved
    workflows: RwLock<HashMap<String, Arc<WorkflowSlot>>>,
    /// Per-workflow gate: held shared by every load or mutation of the
    /// workflow and exclusively by its delete
    gates: Cache<String, Arc<RwLock<()>>>,
}

impl WorkflowEngine {
    pub fn new(
        registry: Arc<StepRegistry>,
        store: Arc<dyn WorkflowPersistence>,
        profiles: Arc<dyn ProfileStore>,
    ) -> Self {
        let tracker = BehaviorTracker::new(profiles.clone(), BehaviorConfig::default());
        Self {
            registry,
            store,
            profiles,
            tracker,
            auto_save: AutoSaveScheduler::new(30),
            workflows: RwLock::new(HashMap::new()),
            gates: Cache::builder()
                .max_capacity(GATE_CAPACITY)
                .time_to_idle(Duration::from_secs(GATE_IDLE_SECONDS))
                .build(),
        }
    }

    /// Engine over the certificate catalog with a file system store
    pub fn from_config(config: &FlexflowConfig) -> Result<Self, RegistryError> {
        let registry = Arc::new(StepRegistry::certificate_catalog()?);
        let store = Arc::new(FileSystemStore::new(config.persistence.clone()));

        Ok(Self::new(registry, store.clone(), store)
            .with_auto_save_interval(config.persistence.auto_save_interval_seconds)
            .with_behavior_config(config.behavior.clone()))
    }

    pub fn with_auto_save_interval(mut self, seconds: u64) -> Self {
        self.auto_save = AutoSaveScheduler::new(seconds);
        self
    }

    pub fn with_behavior_config(mut self, config: BehaviorConfig) -> Self {
        self.tracker = BehaviorTracker::new(self.profiles.clone(), config);
        self
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    /// Start a workflow for the user. The initial state is saved right away;
    /// a failed save is logged and the workflow stays live in memory.
    pub async fn create_workflow(&self, user_id: &str, mode: WorkflowMode) -> String {
        let span = create_workflow_span("create", None, Some(user_id));
        async {
            let now = Utc::now();
            let state = WorkflowMachine::new(&self.registry).create(user_id, mode, true, now);
            let workflow_id = state.workflow_id.clone();

            let reason = if state.is_finished() {
                SaveReason::Completed
            } else {
                SaveReason::Created
            };
            let saved = self.save_best_effort(&state, reason, now).await;

            if state.is_finished() && saved {
                self.auto_save.forget(&workflow_id).await;
            } else {
                self.workflows
                    .write()
                    .await
                    .insert(workflow_id.clone(), WorkflowSlot::new(state));
            }
            self.tracker.record_workflow_created(user_id, mode).await;

            workflow_id
        }
        .instrument(span)
        .await
    }

    /// Live state, loading it from the store when this engine has not seen it
    pub async fn get_workflow(&self, workflow_id: &str) -> Option<WorkflowState> {
        let gate = self.gate(workflow_id).await;
        let _open = gate.read().await;
        match self.slot(workflow_id).await {
            Ok(slot) => Some(slot.read().await),
            Err(e) => {
                self.log_rejection("get", workflow_id, None, &e);
                None
            }
        }
    }

    pub async fn advance_step(&self, workflow_id: &str, step_id: &str, payload: Payload) -> bool {
        let result = self.try_advance_step(workflow_id, step_id, payload).await;
        self.settle("advance", workflow_id, step_id, result)
    }

    pub async fn try_advance_step(
        &self,
        workflow_id: &str,
        step_id: &str,
        payload: Payload,
    ) -> Result<TransitionOutcome, WorkflowError> {
        self.mutate("advance", workflow_id, |machine, state, now| {
            machine.advance(state, step_id, payload, now)
        })
        .await
    }

    pub async fn jump_to_step(&self, workflow_id: &str, step_id: &str) -> bool {
        let result = self.try_jump_to_step(workflow_id, step_id).await;
        self.settle("jump", workflow_id, step_id, result)
    }

    pub async fn try_jump_to_step(&self, workflow_id: &str, step_id: &str) -> Result<TransitionOutcome, WorkflowError> {
        self.mutate("jump", workflow_id, |machine, state, now| {
            machine.jump(state, step_id, now)
        })
        .await
    }

    pub async fn skip_step(&self, workflow_id: &str, step_id: &str) -> bool {
        let result = self.try_skip_step(workflow_id, step_id).await;
        self.settle("skip", workflow_id, step_id, result)
    }

    pub async fn try_skip_step(&self, workflow_id: &str, step_id: &str) -> Result<TransitionOutcome, WorkflowError> {
        self.mutate("skip", workflow_id, |machine, state, now| {
            machine.skip(state, step_id, now)
        })
        .await
    }

    /// Mark the active step as failed
    pub async fn try_fail_step(
        &self,
        workflow_id: &str,
        step_id: &str,
        reason: &str,
    ) -> Result<TransitionOutcome, WorkflowError> {
        self.mutate("fail", workflow_id, |machine, state, now| {
            machine.fail(state, step_id, reason, now)
        })
        .await
    }

    /// Hand the current step to the collaborator and apply its answer
    pub async fn run_current_step(
        &self,
        workflow_id: &str,
        handler: &dyn StepHandler,
    ) -> Result<StepRun, WorkflowError> {
        let state = {
            let gate = self.gate(workflow_id).await;
            let _open = gate.read().await;
            self.slot(workflow_id).await?.read().await
        };
        let step_id = match state.current_step.clone() {
            Some(step_id) => step_id,
            None if state.is_finished() => {
                return Err(WorkflowError::WorkflowFinished {
                    workflow_id: workflow_id.to_string(),
                })
            }
            None => {
                return Err(WorkflowError::NoCurrentStep {
                    workflow_id: workflow_id.to_string(),
                })
            }
        };
        let step = self.registry.get(&step_id)?;

        match handler.collect(step, &state.form_data).await {
            StepOutcome::Ready { payload } => {
                let outcome = self.try_advance_step(workflow_id, &step_id, payload).await?;
                Ok(StepRun::Advanced {
                    step_id,
                    current_step: outcome.current_step,
                    finished: outcome.finished,
                })
            }
            StepOutcome::NotReady { reason } => {
                debug!(
                    workflow.id = %workflow_id,
                    step.id = %step_id,
                    reason = %reason,
                    "Step not ready"
                );
                Ok(StepRun::NotReady { step_id, reason })
            }
            StepOutcome::Failed { reason } => {
                self.try_fail_step(workflow_id, &step_id, &reason).await?;
                Ok(StepRun::Failed { step_id, reason })
            }
        }
    }

    /// Flush to the store regardless of the auto-save interval
    pub async fn save_workflow(&self, workflow_id: &str) -> bool {
        match self.try_save_workflow(workflow_id).await {
            Ok(()) => true,
            Err(e) => {
                self.log_rejection("save", workflow_id, None, &e);
                false
            }
        }
    }

    pub async fn try_save_workflow(&self, workflow_id: &str) -> Result<(), WorkflowError> {
        let gate = self.gate(workflow_id).await;
        let _open = gate.read().await;
        let (slot, state) = self.lock_writer(workflow_id).await?;

        self.store.save_workflow(&state, SaveReason::Manual).await?;
        self.auto_save.mark_saved(workflow_id, Utc::now()).await;
        info!(workflow.id = %workflow_id, user.id = %state.user_id, "Workflow saved");

        if state.is_finished() {
            self.retire(&slot, workflow_id).await;
        }
        Ok(())
    }

    /// Enable or disable interval saves for one workflow
    pub async fn set_auto_save(&self, workflow_id: &str, enabled: bool) -> bool {
        let result = self
            .mutate("auto_save", workflow_id, |_, state, now| {
                state.auto_save_enabled = enabled;
                state.updated_at = now;
                Ok(TransitionOutcome {
                    step_id: state.current_step.clone().unwrap_or_default(),
                    kind: TransitionKind::NoOp,
                    duration_seconds: None,
                    current_step: state.current_step.clone(),
                    finished: false,
                })
            })
            .await;
        result.is_ok()
    }

    pub async fn get_progress(&self, workflow_id: &str) -> Option<ProgressInfo> {
        let state = self.get_workflow(workflow_id).await?;
        let profile = self.tracker.profile(&state.user_id).await;
        Some(WorkflowMachine::new(&self.registry).progress(&state, Some(&profile)))
    }

    /// Steps the user could work on next, in catalog order
    pub async fn available_steps(&self, workflow_id: &str) -> Option<Vec<String>> {
        let state = self.get_workflow(workflow_id).await?;
        Some(available_steps(&self.registry, &state))
    }

    /// Stored and live workflows of the user, newest update first. Live
    /// snapshots win over stored records of the same workflow.
    pub async fn list_user_workflows(&self, user_id: &str) -> Vec<WorkflowSummary> {
        let mut summaries: HashMap<String, WorkflowSummary> = match self.store.list_for_user(user_id).await {
            Ok(stored) => stored
                .into_iter()
                .map(|summary| (summary.workflow_id.clone(), summary))
                .collect(),
            Err(e) => {
                warn!(user.id = %user_id, error = %e, "Failed to list stored workflows");
                HashMap::new()
            }
        };

        for state in self.live_states_for(user_id).await {
            summaries.insert(state.workflow_id.clone(), state.summary());
        }

        let mut summaries: Vec<WorkflowSummary> = summaries.into_values().collect();
        summaries.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.workflow_id.cmp(&b.workflow_id))
        });
        summaries
    }

    /// Most recently updated workflow of the user, live or stored
    pub async fn resume_latest_workflow(&self, user_id: &str) -> Option<String> {
        let stored = match self.store.load_latest_for_user(user_id).await {
            Ok(state) => state,
            Err(PersistenceError::CorruptRecord { path, reason }) => {
                error!(user.id = %user_id, file = ?path, reason = %reason, "Corrupt latest pointer");
                None
            }
            Err(e) => {
                warn!(user.id = %user_id, error = %e, "Failed to read latest pointer");
                None
            }
        };

        let live = self
            .live_states_for(user_id)
            .await
            .into_iter()
            .max_by_key(|state| state.updated_at);

        let latest = match (stored, live) {
            (Some(stored), Some(live)) if stored.updated_at > live.updated_at => Some(stored),
            (_, Some(live)) => Some(live),
            (stored, None) => stored,
        };

        let workflow_id = match latest {
            Some(state) => {
                // Loads a stored workflow into the live set
                let gate = self.gate(&state.workflow_id).await;
                let _open = gate.read().await;
                self.slot(&state.workflow_id).await.ok()?;
                state.workflow_id
            }
            None => self
                .list_user_workflows(user_id)
                .await
                .into_iter()
                .next()?
                .workflow_id,
        };

        info!(workflow.id = %workflow_id, user.id = %user_id, "Workflow resumed");
        Some(workflow_id)
    }

    pub async fn delete_workflow(&self, workflow_id: &str) -> bool {
        match self.try_delete_workflow(workflow_id).await {
            Ok(deleted) => deleted,
            Err(e) => {
                self.log_rejection("delete", workflow_id, None, &e);
                false
            }
        }
    }

    /// Returns false when neither a live nor a stored workflow existed
    pub async fn try_delete_workflow(&self, workflow_id: &str) -> Result<bool, WorkflowError> {
        // No load or mutation of this workflow runs until the record is gone
        let gate = self.gate(workflow_id).await;
        let _closed = gate.write().await;

        let stored = self.store.delete_workflow(workflow_id).await?;
        let live = self.workflows.write().await.remove(workflow_id);
        self.auto_save.forget(workflow_id).await;

        let deleted = live.is_some() || stored;
        if deleted {
            info!(workflow.id = %workflow_id, "Workflow deleted");
        }
        Ok(deleted)
    }

    pub async fn behavior_profile(&self, user_id: &str) -> UserBehaviorProfile {
        self.tracker.profile(user_id).await
    }

    pub async fn get_suggestions(&self, user_id: &str) -> Suggestions {
        let profile = self.tracker.profile(user_id).await;
        behavior::suggestions::suggestions(&profile, &self.registry, self.tracker.config())
    }

    pub async fn get_dashboard_widgets(&self, user_id: &str) -> Vec<Widget> {
        let profile = self.tracker.profile(user_id).await;
        let recent = self.list_user_workflows(user_id).await;
        behavior::suggestions::dashboard_widgets(&profile, &recent, self.tracker.config())
    }

    async fn gate(&self, workflow_id: &str) -> Arc<RwLock<()>> {
        self.gates
            .get_with(workflow_id.to_string(), async { Arc::new(RwLock::new(())) })
            .await
    }

    /// Live slot of the workflow. A stored record is loaded on a miss; a
    /// finished one is handed out without joining the live map. Callers hold
    /// the workflow's gate.
    async fn slot(&self, workflow_id: &str) -> Result<Arc<WorkflowSlot>, WorkflowError> {
        if let Some(slot) = self.workflows.read().await.get(workflow_id) {
            return Ok(slot.clone());
        }

        match self.store.load_workflow(workflow_id).await {
            Ok(Some(state)) if state.is_finished() => Ok(WorkflowSlot::new(state)),
            Ok(Some(state)) => {
                debug!(workflow.id = %workflow_id, user.id = %state.user_id, "Workflow loaded from store");
                let slot = self
                    .workflows
                    .write()
                    .await
                    .entry(workflow_id.to_string())
                    .or_insert_with(|| WorkflowSlot::new(state))
                    .clone();
                Ok(slot)
            }
            Ok(None) => Err(WorkflowError::NotFound {
                workflow_id: workflow_id.to_string(),
            }),
            Err(PersistenceError::CorruptRecord { path, reason }) => {
                error!(
                    workflow.id = %workflow_id,
                    file = ?path,
                    reason = %reason,
                    "Corrupt workflow record, treating as missing"
                );
                Err(WorkflowError::NotFound {
                    workflow_id: workflow_id.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn live_states_for(&self, user_id: &str) -> Vec<WorkflowState> {
        let slots: Vec<Arc<WorkflowSlot>> = self.workflows.read().await.values().cloned().collect();

        let mut states = Vec::new();
        for slot in slots {
            let state = slot.read().await;
            if state.user_id == user_id {
                states.push(state);
            }
        }
        states
    }

    /// Apply one state machine operation under the workflow's writer lock,
    /// publish the new snapshot, run the save policy, then feed the behavior
    /// tracker once the lock is released.
    async fn mutate<F>(&self, operation: &'static str, workflow_id: &str, apply: F) -> Result<TransitionOutcome, WorkflowError>
    where
        F: FnOnce(&WorkflowMachine<'_>, &mut WorkflowState, DateTime<Utc>) -> Result<TransitionOutcome, WorkflowError>,
    {
        let span = create_workflow_span(operation, Some(workflow_id), None);
        async {
            let (snapshot, outcome) = {
                let gate = self.gate(workflow_id).await;
                let _open = gate.read().await;
                let (slot, mut state) = self.lock_writer(workflow_id).await?;

                let now = Utc::now();
                let outcome = apply(&WorkflowMachine::new(&self.registry), &mut state, now)?;

                let snapshot = state.clone();
                *slot.snapshot.write().await = snapshot.clone();
                let saved = self.save_after(&snapshot, &outcome, now).await;
                if saved && snapshot.is_finished() {
                    self.retire(&slot, workflow_id).await;
                }
                (snapshot, outcome)
            };

            self.tracker.record_transition(&snapshot, &outcome).await;
            Ok::<_, WorkflowError>(outcome)
        }
        .instrument(span)
        .await
    }

    /// Writer lock of the workflow, with the slot mapped so concurrent
    /// writers share it. A handle retired while we waited is dropped and the
    /// workflow reloaded from the store.
    async fn lock_writer(
        &self,
        workflow_id: &str,
    ) -> Result<(Arc<WorkflowSlot>, OwnedMutexGuard<WorkflowState>), WorkflowError> {
        loop {
            let loaded = self.slot(workflow_id).await?;
            let slot = self
                .workflows
                .write()
                .await
                .entry(workflow_id.to_string())
                .or_insert(loaded)
                .clone();

            let guard = slot.writer.clone().lock_owned().await;
            if !slot.retired.load(Ordering::Acquire) {
                return Ok((slot, guard));
            }
        }
    }

    /// Drop a saved, finished workflow from memory. Called with its writer
    /// lock held; later reads go to the store.
    async fn retire(&self, slot: &Arc<WorkflowSlot>, workflow_id: &str) {
        let mut workflows = self.workflows.write().await;
        if workflows.get(workflow_id).is_some_and(|mapped| Arc::ptr_eq(mapped, slot)) {
            workflows.remove(workflow_id);
        }
        slot.retired.store(true, Ordering::Release);
        drop(workflows);

        self.auto_save.forget(workflow_id).await;
        debug!(workflow.id = %workflow_id, "Finished workflow released from memory");
    }

    /// Completion is always saved; anything else only when auto-save is on
    /// and the interval has elapsed. Returns true when a save went through.
    async fn save_after(&self, state: &WorkflowState, outcome: &TransitionOutcome, now: DateTime<Utc>) -> bool {
        let reason = if outcome.finished {
            SaveReason::Completed
        } else if state.auto_save_enabled
            && outcome.kind != TransitionKind::NoOp
            && self.auto_save.is_due(&state.workflow_id, now).await
        {
            SaveReason::AutoSave
        } else {
            return false;
        };

        self.save_best_effort(state, reason, now).await
    }

    async fn save_best_effort(&self, state: &WorkflowState, reason: SaveReason, now: DateTime<Utc>) -> bool {
        match self.store.save_workflow(state, reason).await {
            Ok(()) => {
                self.auto_save.mark_saved(&state.workflow_id, now).await;
                debug!(workflow.id = %state.workflow_id, reason = ?reason, "Workflow persisted");
                true
            }
            Err(e) => {
                warn!(
                    workflow.id = %state.workflow_id,
                    reason = ?reason,
                    error = %e,
                    "Best-effort save failed"
                );
                false
            }
        }
    }

    fn settle(
        &self,
        operation: &str,
        workflow_id: &str,
        step_id: &str,
        result: Result<TransitionOutcome, WorkflowError>,
    ) -> bool {
        match result {
            Ok(_) => true,
            Err(e) => {
                self.log_rejection(operation, workflow_id, Some(step_id), &e);
                false
            }
        }
    }

    fn log_rejection(&self, operation: &str, workflow_id: &str, step_id: Option<&str>, err: &WorkflowError) {
        match err {
            WorkflowError::Persistence(_) => warn!(
                operation = operation,
                workflow.id = %workflow_id,
                step.id = ?step_id,
                error = %err,
                "Workflow operation failed"
            ),
            WorkflowError::NotFound { .. } => debug!(
                operation = operation,
                workflow.id = %workflow_id,
                "Workflow not found"
            ),
            _ => info!(
                operation = operation,
                workflow.id = %workflow_id,
                step.id = ?step_id,
                error = %err,
                "Workflow operation rejected"
            ),
        }
    }
}
