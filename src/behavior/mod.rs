//! Per-user usage statistics that feed suggestions and time estimates.
//!
//! Profile writes are a best-effort side effect of workflow transitions: every
//! failure is logged and swallowed so the primary transition is never affected.

pub mod suggestions;

pub use suggestions::{ActionCount, ModeSuggestion, Suggestions, Widget};

use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::persistence::{PersistenceError, ProfileStore};
use crate::workflow::{TransitionKind, TransitionOutcome, WorkflowMode, WorkflowState};

/// A user action counted in `feature_usage`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TrackedAction {
    ModeSelected(WorkflowMode),
    StepAdvanced(String),
    StepSkipped(String),
    StepJumped(String),
    WorkflowCompleted,
}

impl TrackedAction {
    pub fn key(&self) -> String {
        match self {
            TrackedAction::ModeSelected(mode) => format!("mode:{}", mode),
            TrackedAction::StepAdvanced(step) => format!("advance:{}", step),
            TrackedAction::StepSkipped(step) => format!("skip:{}", step),
            TrackedAction::StepJumped(step) => format!("jump:{}", step),
            TrackedAction::WorkflowCompleted => "workflow:completed".to_string(),
        }
    }

    pub fn parse(key: &str) -> Option<Self> {
        let (kind, value) = key.split_once(':')?;
        match kind {
            "mode" => value.parse().ok().map(TrackedAction::ModeSelected),
            "advance" => Some(TrackedAction::StepAdvanced(value.to_string())),
            "skip" => Some(TrackedAction::StepSkipped(value.to_string())),
            "jump" => Some(TrackedAction::StepJumped(value.to_string())),
            "workflow" if value == "completed" => Some(TrackedAction::WorkflowCompleted),
            _ => None,
        }
    }
}

impl fmt::Display for TrackedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserBehaviorProfile {
    pub user_id: String,
    pub feature_usage: BTreeMap<String, u64>,
    /// Exponential moving average of time spent per step
    pub average_step_seconds: BTreeMap<String, f64>,
    pub successful_completions: u64,
    pub last_updated: DateTime<Utc>,
    /// Exponential moving average of whole-workflow wall time
    #[serde(default)]
    pub average_completion_seconds: Option<f64>,
    #[serde(default)]
    pub mode_completions: BTreeMap<String, u64>,
}

impl UserBehaviorProfile {
    pub fn new(user_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            feature_usage: BTreeMap::new(),
            average_step_seconds: BTreeMap::new(),
            successful_completions: 0,
            last_updated: now,
            average_completion_seconds: None,
            mode_completions: BTreeMap::new(),
        }
    }

    pub fn record_action(&mut self, action: &TrackedAction, now: DateTime<Utc>) {
        *self.feature_usage.entry(action.key()).or_insert(0) += 1;
        self.last_updated = now;
    }

    pub fn usage(&self, action: &TrackedAction) -> u64 {
        self.feature_usage.get(&action.key()).copied().unwrap_or(0)
    }

    pub fn record_step_duration(&mut self, step_id: &str, sample_seconds: f64, weight: f64, now: DateTime<Utc>) {
        let average = self
            .average_step_seconds
            .get(step_id)
            .map(|old| moving_average(*old, sample_seconds, weight))
            .unwrap_or(sample_seconds);
        self.average_step_seconds.insert(step_id.to_string(), average);
        self.last_updated = now;
    }

    pub fn record_completion(&mut self, mode: WorkflowMode, wall_seconds: Option<f64>, weight: f64, now: DateTime<Utc>) {
        self.successful_completions += 1;
        *self.mode_completions.entry(mode.to_string()).or_insert(0) += 1;
        if let Some(sample) = wall_seconds {
            self.average_completion_seconds = Some(
                self.average_completion_seconds
                    .map(|old| moving_average(old, sample, weight))
                    .unwrap_or(sample),
            );
        }
        self.record_action(&TrackedAction::WorkflowCompleted, now);
    }

    /// Usage counts of `mode:*` actions
    pub fn mode_usage(&self) -> BTreeMap<WorkflowMode, u64> {
        let mut usage = BTreeMap::new();
        for (key, count) in &self.feature_usage {
            if let Some(TrackedAction::ModeSelected(mode)) = TrackedAction::parse(key) {
                *usage.entry(mode).or_insert(0) += count;
            }
        }
        usage
    }
}

fn moving_average(old: f64, sample: f64, weight: f64) -> f64 {
    old * (1.0 - weight) + sample * weight
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorConfig {
    /// Weight of the newest sample in moving averages
    pub ema_weight: f64,
    pub suggestion_min_completions: u64,
    pub dashboard_min_completions: u64,
    pub benchmark_completion_seconds: f64,
    pub recent_workflows_limit: usize,
    pub most_used_actions_limit: usize,
    /// Repetitions of a skip or jump before it becomes a shortcut hint
    pub shortcut_min_occurrences: u64,
    pub profile_cache_capacity: u64,
    pub profile_cache_idle_minutes: u64,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            ema_weight: 0.3,
            suggestion_min_completions: 3,
            dashboard_min_completions: 5,
            benchmark_completion_seconds: 300.0,
            recent_workflows_limit: 3,
            most_used_actions_limit: 5,
            shortcut_min_occurrences: 3,
            profile_cache_capacity: 10_000,
            profile_cache_idle_minutes: 30,
        }
    }
}

/// Accumulates behavior profiles and writes them through to a `ProfileStore`
pub struct BehaviorTracker {
    store: Arc<dyn ProfileStore>,
    cache: Cache<String, UserBehaviorProfile>,
    /// Serializes read-modify-write of one user's profile; users never wait on each other
    user_locks: Cache<String, Arc<Mutex<()>>>,
    config: BehaviorConfig,
}

impl fmt::Debug for BehaviorTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BehaviorTracker")
            .field("cached_profiles", &self.cache.entry_count())
            .field("config", &self.config)
            .finish()
    }
}

impl BehaviorTracker {
    pub fn new(store: Arc<dyn ProfileStore>, config: BehaviorConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.profile_cache_capacity)
            .time_to_idle(Duration::from_secs(config.profile_cache_idle_minutes * 60))
            .build();
        let user_locks = Cache::builder()
            .max_capacity(config.profile_cache_capacity)
            .time_to_idle(Duration::from_secs(config.profile_cache_idle_minutes * 60))
            .build();

        Self {
            store,
            cache,
            user_locks,
            config,
        }
    }

    pub fn config(&self) -> &BehaviorConfig {
        &self.config
    }

    /// Current profile for the user; a fresh profile when none is stored or
    /// the stored one cannot be read
    pub async fn profile(&self, user_id: &str) -> UserBehaviorProfile {
        match self.load(user_id).await {
            Ok(profile) => profile,
            Err(e) => {
                warn!(user.id = %user_id, error = %e, "Failed to load behavior profile");
                UserBehaviorProfile::new(user_id, Utc::now())
            }
        }
    }

    pub async fn record_workflow_created(&self, user_id: &str, mode: WorkflowMode) {
        let action = TrackedAction::ModeSelected(mode);
        self.update(user_id, |profile, now| profile.record_action(&action, now))
            .await;
    }

    /// Fold a state machine transition into the owner's profile
    pub async fn record_transition(&self, state: &WorkflowState, outcome: &TransitionOutcome) {
        let action = match outcome.kind {
            TransitionKind::Advanced | TransitionKind::Readvanced => {
                TrackedAction::StepAdvanced(outcome.step_id.clone())
            }
            TransitionKind::Skipped => TrackedAction::StepSkipped(outcome.step_id.clone()),
            TransitionKind::Jumped => TrackedAction::StepJumped(outcome.step_id.clone()),
            TransitionKind::Failed | TransitionKind::NoOp => return,
        };

        let weight = self.config.ema_weight;
        let wall_seconds = state
            .completed_at
            .map(|done| (done - state.created_at).num_milliseconds().max(0) as f64 / 1000.0);

        self.update(&state.user_id, |profile, now| {
            profile.record_action(&action, now);
            if let Some(sample) = outcome.duration_seconds {
                profile.record_step_duration(&outcome.step_id, sample, weight, now);
            }
            if outcome.finished {
                profile.record_completion(state.mode, wall_seconds, weight, now);
            }
        })
        .await;
    }

    async fn load(&self, user_id: &str) -> Result<UserBehaviorProfile, PersistenceError> {
        if let Some(profile) = self.cache.get(user_id).await {
            return Ok(profile);
        }

        let profile = match self.store.load_profile(user_id).await {
            Ok(Some(profile)) => profile,
            Ok(None) => UserBehaviorProfile::new(user_id, Utc::now()),
            Err(PersistenceError::CorruptRecord { path, reason }) => {
                error!(
                    user.id = %user_id,
                    file = ?path,
                    reason = %reason,
                    "Corrupt behavior profile, starting a fresh one"
                );
                UserBehaviorProfile::new(user_id, Utc::now())
            }
            Err(e) => return Err(e),
        };

        self.cache.insert(user_id.to_string(), profile.clone()).await;
        Ok(profile)
    }

    async fn update<F>(&self, user_id: &str, apply: F)
    where
        F: FnOnce(&mut UserBehaviorProfile, DateTime<Utc>),
    {
        let user_lock = self
            .user_locks
            .get_with(user_id.to_string(), async { Arc::new(Mutex::new(())) })
            .await;
        let _guard = user_lock.lock().await;

        let mut profile = match self.load(user_id).await {
            Ok(profile) => profile,
            Err(e) => {
                warn!(user.id = %user_id, error = %e, "Skipping behavior update, profile unavailable");
                return;
            }
        };

        apply(&mut profile, Utc::now());
        self.cache.insert(user_id.to_string(), profile.clone()).await;

        match self.store.save_profile(&profile).await {
            Ok(()) => debug!(user.id = %user_id, "Behavior profile updated"),
            Err(e) => warn!(user.id = %user_id, error = %e, "Failed to persist behavior profile"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MockProfileStore;
    use crate::workflow::{Payload, StepRegistry, WorkflowMachine};
    use std::path::PathBuf;

    fn tracker(store: MockProfileStore) -> BehaviorTracker {
        BehaviorTracker::new(Arc::new(store), BehaviorConfig::default())
    }

    #[test]
    fn test_action_keys_round_trip() {
        for action in [
            TrackedAction::ModeSelected(WorkflowMode::Guided),
            TrackedAction::StepAdvanced("upload_data".to_string()),
            TrackedAction::StepSkipped("preview".to_string()),
            TrackedAction::StepJumped("generate".to_string()),
            TrackedAction::WorkflowCompleted,
        ] {
            assert_eq!(TrackedAction::parse(&action.key()), Some(action));
        }
        assert_eq!(TrackedAction::parse("mode:turbo"), None);
        assert_eq!(TrackedAction::parse("garbage"), None);
    }

    #[test]
    fn test_step_duration_moving_average() {
        let now = Utc::now();
        let mut profile = UserBehaviorProfile::new("alice", now);

        profile.record_step_duration("a", 10.0, 0.3, now);
        assert_eq!(profile.average_step_seconds["a"], 10.0);

        profile.record_step_duration("a", 20.0, 0.3, now);
        assert!((profile.average_step_seconds["a"] - 13.0).abs() < 1e-9);
    }

    #[test]
    fn test_mode_usage_aggregates_mode_keys() {
        let now = Utc::now();
        let mut profile = UserBehaviorProfile::new("alice", now);
        profile.record_action(&TrackedAction::ModeSelected(WorkflowMode::Quick), now);
        profile.record_action(&TrackedAction::ModeSelected(WorkflowMode::Quick), now);
        profile.record_action(&TrackedAction::ModeSelected(WorkflowMode::Advanced), now);
        profile.record_action(&TrackedAction::StepAdvanced("a".to_string()), now);

        let usage = profile.mode_usage();
        assert_eq!(usage.get(&WorkflowMode::Quick), Some(&2));
        assert_eq!(usage.get(&WorkflowMode::Advanced), Some(&1));
        assert_eq!(usage.get(&WorkflowMode::Guided), None);
    }

    #[tokio::test]
    async fn test_save_failures_are_swallowed() {
        let mut store = MockProfileStore::new();
        store.expect_load_profile().returning(|_| Ok(None));
        store.expect_save_profile().returning(|_| {
            Err(PersistenceError::LockError {
                reason: "disk full".to_string(),
            })
        });
        let tracker = tracker(store);

        tracker.record_workflow_created("alice", WorkflowMode::Quick).await;
        tracker.record_workflow_created("alice", WorkflowMode::Quick).await;

        let profile = tracker.profile("alice").await;
        assert_eq!(profile.usage(&TrackedAction::ModeSelected(WorkflowMode::Quick)), 2);
    }

    #[tokio::test]
    async fn test_corrupt_profile_starts_fresh() {
        let mut store = MockProfileStore::new();
        store.expect_load_profile().returning(|_| {
            Err(PersistenceError::CorruptRecord {
                path: PathBuf::from("profiles/alice.json"),
                reason: "trailing characters".to_string(),
            })
        });
        store.expect_save_profile().returning(|_| Ok(()));
        let tracker = tracker(store);

        let profile = tracker.profile("alice").await;
        assert_eq!(profile.successful_completions, 0);
        assert!(profile.feature_usage.is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_profile_is_not_overwritten() {
        let mut store = MockProfileStore::new();
        store.expect_load_profile().returning(|_| {
            Err(PersistenceError::IoError(std::io::Error::other("permission denied")))
        });
        store.expect_save_profile().never();
        let tracker = tracker(store);

        tracker.record_workflow_created("alice", WorkflowMode::Guided).await;
    }

    #[tokio::test]
    async fn test_record_transition_tracks_timing_and_completion() {
        let mut store = MockProfileStore::new();
        store.expect_load_profile().returning(|_| Ok(None));
        store.expect_save_profile().returning(|_| Ok(()));
        let tracker = tracker(store);

        let mut registry = StepRegistry::new();
        registry
            .register(crate::workflow::WorkflowStep::new("only", "Only"))
            .unwrap();
        let machine = WorkflowMachine::new(&registry);
        let start = Utc::now();
        let mut state = machine.create("alice", WorkflowMode::Quick, true, start);
        let outcome = machine
            .advance(&mut state, "only", Payload::new(), start + chrono::Duration::seconds(8))
            .unwrap();

        tracker.record_transition(&state, &outcome).await;

        let profile = tracker.profile("alice").await;
        assert_eq!(profile.successful_completions, 1);
        assert_eq!(profile.average_step_seconds["only"], 8.0);
        assert_eq!(profile.average_completion_seconds, Some(8.0));
        assert_eq!(profile.usage(&TrackedAction::StepAdvanced("only".to_string())), 1);
        assert_eq!(profile.usage(&TrackedAction::WorkflowCompleted), 1);
        assert_eq!(profile.mode_completions.get("quick"), Some(&1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_profile_write_only_delays_its_own_user() {
        let bob_writing = Arc::new(tokio::sync::Notify::new());
        let signal = bob_writing.clone();

        let mut store = MockProfileStore::new();
        store.expect_load_profile().returning(|_| Ok(None));
        store
            .expect_save_profile()
            .withf(|profile| profile.user_id == "bob")
            .returning(move |_| {
                signal.notify_one();
                std::thread::sleep(std::time::Duration::from_millis(1500));
                Ok(())
            });
        store
            .expect_save_profile()
            .withf(|profile| profile.user_id == "alice")
            .returning(|_| Ok(()));
        let tracker = Arc::new(tracker(store));

        let bob = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.record_workflow_created("bob", WorkflowMode::Quick).await })
        };
        bob_writing.notified().await;

        let started = std::time::Instant::now();
        tracker.record_workflow_created("alice", WorkflowMode::Guided).await;
        assert!(
            started.elapsed() < std::time::Duration::from_millis(500),
            "alice waited {:?} on bob's profile write",
            started.elapsed()
        );
        assert_eq!(
            tracker.profile("alice").await.usage(&TrackedAction::ModeSelected(WorkflowMode::Guided)),
            1
        );

        bob.await.unwrap();
        assert_eq!(
            tracker.profile("bob").await.usage(&TrackedAction::ModeSelected(WorkflowMode::Quick)),
            1
        );
    }

    #[tokio::test]
    async fn test_same_user_updates_are_not_lost() {
        let mut store = MockProfileStore::new();
        store.expect_load_profile().returning(|_| Ok(None));
        store.expect_save_profile().returning(|_| Ok(()));
        let tracker = Arc::new(tracker(store));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let tracker = tracker.clone();
                tokio::spawn(async move { tracker.record_workflow_created("alice", WorkflowMode::Quick).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let profile = tracker.profile("alice").await;
        assert_eq!(profile.usage(&TrackedAction::ModeSelected(WorkflowMode::Quick)), 8);
    }
}
