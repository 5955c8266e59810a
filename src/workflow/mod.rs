//! Step catalog, dependency resolution and the per-workflow state machine.
//!
//! Everything in this module is synchronous and free of I/O: the engine feeds
//! it the current time and persists whatever it produces.

pub mod registry;
pub mod resolver;
pub mod state;
pub mod state_machine;

pub use registry::{RegistryError, StepRegistry, WorkflowStep};
pub use resolver::{available_steps, dependencies_met, next_step, unmet_dependencies};
pub use state::{
    ParseModeError, Payload, ProgressInfo, StepStatus, WorkflowMode, WorkflowState, WorkflowSummary,
};
pub use state_machine::{TransitionKind, TransitionOutcome, WorkflowError, WorkflowMachine};
