//! Durable storage for workflow state and behavior profiles.
//!
//! Records are written atomically (temp file, fsync, rename) under an
//! exclusive per-record file lock. Reads and listings never take that lock, so
//! dashboards keep working while a workflow is being edited.

pub mod auto_save;
pub mod filesystem;

pub use auto_save::AutoSaveScheduler;
pub use filesystem::FileSystemStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[cfg(any(test, feature = "testing"))]
use mockall::automock;

use crate::behavior::UserBehaviorProfile;
use crate::workflow::{WorkflowState, WorkflowSummary};

pub const RECORD_VERSION: &str = "1";

/// Errors that can occur during persistence operations
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Corrupt record at {path}: {reason}")]
    CorruptRecord { path: PathBuf, reason: String },

    #[error("Lock acquisition failed: {reason}")]
    LockError { reason: String },
}

/// Why a record was written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaveReason {
    Created,
    AutoSave,
    Manual,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveOrigin {
    pub hostname: String,
    pub pid: u32,
}

impl SaveOrigin {
    pub fn current() -> Self {
        Self {
            hostname: hostname::get()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string(),
            pid: std::process::id(),
        }
    }
}

/// On-disk envelope around a workflow state. The per-user latest pointer uses
/// the same shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedWorkflow {
    pub version: String,
    pub saved_at: DateTime<Utc>,
    pub reason: SaveReason,
    pub origin: SaveOrigin,
    pub state: WorkflowState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub enabled: bool,
    pub directory: PathBuf,
    pub auto_save_interval_seconds: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: PathBuf::from(".flexflow/state"),
            auto_save_interval_seconds: 30,
        }
    }
}

/// Storage of workflow records and the per-user latest pointer
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait WorkflowPersistence: Send + Sync {
    /// Write the record and move the owner's latest pointer to it
    async fn save_workflow(&self, state: &WorkflowState, reason: SaveReason) -> Result<(), PersistenceError>;

    async fn load_workflow(&self, workflow_id: &str) -> Result<Option<WorkflowState>, PersistenceError>;

    async fn load_latest_for_user(&self, user_id: &str) -> Result<Option<WorkflowState>, PersistenceError>;

    /// Summaries of the user's stored workflows, newest update first
    async fn list_for_user(&self, user_id: &str) -> Result<Vec<WorkflowSummary>, PersistenceError>;

    /// Returns false when no record existed
    async fn delete_workflow(&self, workflow_id: &str) -> Result<bool, PersistenceError>;
}

/// Storage of per-user behavior profiles
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn load_profile(&self, user_id: &str) -> Result<Option<UserBehaviorProfile>, PersistenceError>;

    async fn save_profile(&self, profile: &UserBehaviorProfile) -> Result<(), PersistenceError>;
}
