// Flexflow - adaptive multi-step workflow orchestration
// This exposes the core components for embedding and integration testing

pub mod behavior;
pub mod config;
pub mod engine;
pub mod persistence;
pub mod telemetry;
pub mod workflow;

// Re-export key types for easy access
pub use behavior::{
    ActionCount, BehaviorConfig, BehaviorTracker, ModeSuggestion, Suggestions, TrackedAction,
    UserBehaviorProfile, Widget,
};
pub use config::{FlexflowConfig, ObservabilityConfig};
pub use engine::{StepHandler, StepOutcome, StepRun, WorkflowEngine};
pub use persistence::{
    AutoSaveScheduler, FileSystemStore, PersistenceConfig, PersistenceError, ProfileStore, SaveReason,
    WorkflowPersistence,
};
pub use telemetry::{create_workflow_span, generate_correlation_id, init_telemetry};
pub use workflow::{
    Payload, ProgressInfo, RegistryError, StepRegistry, StepStatus, TransitionKind, TransitionOutcome,
    WorkflowError, WorkflowMachine, WorkflowMode, WorkflowState, WorkflowStep, WorkflowSummary,
};
