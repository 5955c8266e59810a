use async_trait::async_trait;
use chrono::Utc;
use fd_lock::RwLock;
use serde::de::DeserializeOwned;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, error, info, warn};

use super::{
    PersistedWorkflow, PersistenceConfig, PersistenceError, ProfileStore, SaveOrigin, SaveReason,
    WorkflowPersistence, RECORD_VERSION,
};
use crate::behavior::UserBehaviorProfile;
use crate::workflow::{WorkflowState, WorkflowSummary};

/// File system implementation of workflow and profile persistence.
///
/// Layout under the configured directory:
/// `workflows/<id>.json`, `latest/<user>.json`, `profiles/<user>.json` and
/// `locks/*.lock`.
#[derive(Debug, Clone)]
pub struct FileSystemStore {
    config: PersistenceConfig,
}

impl FileSystemStore {
    pub fn new(config: PersistenceConfig) -> Self {
        Self { config }
    }

    pub fn directory(&self) -> &Path {
        &self.config.directory
    }

    fn workflows_dir(&self) -> PathBuf {
        self.config.directory.join("workflows")
    }

    fn workflow_path(&self, workflow_id: &str) -> PathBuf {
        self.workflows_dir().join(format!("{}.json", record_key(workflow_id)))
    }

    fn latest_path(&self, user_id: &str) -> PathBuf {
        self.config
            .directory
            .join("latest")
            .join(format!("{}.json", record_key(user_id)))
    }

    fn profile_path(&self, user_id: &str) -> PathBuf {
        self.config
            .directory
            .join("profiles")
            .join(format!("{}.json", record_key(user_id)))
    }

    fn lock_path(&self, kind: &str, raw_key: &str) -> PathBuf {
        self.config
            .directory
            .join("locks")
            .join(format!("{}-{}.lock", kind, record_key(raw_key)))
    }

    async fn write_record(&self, lock_path: PathBuf, target: PathBuf, bytes: Vec<u8>) -> Result<(), PersistenceError> {
        tokio::task::spawn_blocking(move || write_atomically(&lock_path, &target, &bytes))
            .await
            .map_err(|e| PersistenceError::IoError(std::io::Error::other(e)))?
    }

    async fn remove_record(&self, lock_path: PathBuf, target: PathBuf) -> Result<bool, PersistenceError> {
        tokio::task::spawn_blocking(move || remove_locked(&lock_path, &target))
            .await
            .map_err(|e| PersistenceError::IoError(std::io::Error::other(e)))?
    }

    /// Read and decode a record; a missing file is `Ok(None)`
    async fn read_record<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, PersistenceError> {
        let contents = match fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|e| PersistenceError::CorruptRecord {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
    }

    async fn read_workflow_record(&self, path: &Path) -> Result<Option<PersistedWorkflow>, PersistenceError> {
        let Some(record) = self.read_record::<PersistedWorkflow>(path).await? else {
            return Ok(None);
        };

        if record.version != RECORD_VERSION {
            return Err(PersistenceError::CorruptRecord {
                path: path.to_path_buf(),
                reason: format!(
                    "unsupported record version {} (expected {})",
                    record.version, RECORD_VERSION
                ),
            });
        }

        Ok(Some(record))
    }
}

#[async_trait]
impl WorkflowPersistence for FileSystemStore {
    async fn save_workflow(&self, state: &WorkflowState, reason: SaveReason) -> Result<(), PersistenceError> {
        if !self.config.enabled {
            return Ok(());
        }

        let record = PersistedWorkflow {
            version: RECORD_VERSION.to_string(),
            saved_at: Utc::now(),
            reason,
            origin: SaveOrigin::current(),
            state: state.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&record)?;

        self.write_record(
            self.lock_path("workflow", &state.workflow_id),
            self.workflow_path(&state.workflow_id),
            bytes.clone(),
        )
        .await?;

        self.write_record(
            self.lock_path("latest", &state.user_id),
            self.latest_path(&state.user_id),
            bytes,
        )
        .await?;

        info!(
            workflow.id = %state.workflow_id,
            user.id = %state.user_id,
            reason = ?reason,
            "Workflow saved"
        );

        Ok(())
    }

    async fn load_workflow(&self, workflow_id: &str) -> Result<Option<WorkflowState>, PersistenceError> {
        if !self.config.enabled {
            return Ok(None);
        }

        let path = self.workflow_path(workflow_id);
        let Some(record) = self.read_workflow_record(&path).await? else {
            debug!(workflow.id = %workflow_id, file = ?path, "No stored workflow record");
            return Ok(None);
        };

        if record.state.workflow_id != workflow_id {
            return Err(PersistenceError::CorruptRecord {
                path,
                reason: format!("record holds workflow {}", record.state.workflow_id),
            });
        }

        debug!(
            workflow.id = %workflow_id,
            saved_at = %record.saved_at,
            reason = ?record.reason,
            "Workflow loaded"
        );

        Ok(Some(record.state))
    }

    async fn load_latest_for_user(&self, user_id: &str) -> Result<Option<WorkflowState>, PersistenceError> {
        if !self.config.enabled {
            return Ok(None);
        }

        let path = self.latest_path(user_id);
        Ok(self.read_workflow_record(&path).await?.map(|record| record.state))
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<WorkflowSummary>, PersistenceError> {
        if !self.config.enabled {
            return Ok(vec![]);
        }

        let dir = self.workflows_dir();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };

        let mut summaries = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }

            match self.read_workflow_record(&path).await {
                Ok(Some(record)) if record.state.user_id == user_id => {
                    summaries.push(record.state.summary());
                }
                Ok(_) => {}
                Err(PersistenceError::CorruptRecord { path, reason }) => {
                    error!(file = ?path, reason = %reason, "Skipping corrupt workflow record");
                }
                Err(e) => {
                    warn!(file = ?path, error = %e, "Failed to read workflow record");
                }
            }
        }

        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }

    async fn delete_workflow(&self, workflow_id: &str) -> Result<bool, PersistenceError> {
        if !self.config.enabled {
            return Ok(false);
        }

        let path = self.workflow_path(workflow_id);
        let owner = match self.read_workflow_record(&path).await {
            Ok(Some(record)) => Some(record.state.user_id),
            Ok(None) => return Ok(false),
            Err(e) => {
                warn!(workflow.id = %workflow_id, error = %e, "Deleting unreadable workflow record");
                None
            }
        };

        let removed = self
            .remove_record(self.lock_path("workflow", workflow_id), path)
            .await?;

        if let Some(user_id) = owner {
            let latest_path = self.latest_path(&user_id);
            let points_here = matches!(
                self.read_workflow_record(&latest_path).await,
                Ok(Some(latest)) if latest.state.workflow_id == workflow_id
            );
            if points_here {
                self.remove_record(self.lock_path("latest", &user_id), latest_path)
                    .await?;
            }
        }

        info!(workflow.id = %workflow_id, removed, "Workflow deleted");
        Ok(removed)
    }
}

#[async_trait]
impl ProfileStore for FileSystemStore {
    async fn load_profile(&self, user_id: &str) -> Result<Option<UserBehaviorProfile>, PersistenceError> {
        if !self.config.enabled {
            return Ok(None);
        }
        self.read_record(&self.profile_path(user_id)).await
    }

    async fn save_profile(&self, profile: &UserBehaviorProfile) -> Result<(), PersistenceError> {
        if !self.config.enabled {
            return Ok(());
        }

        let bytes = serde_json::to_vec_pretty(profile)?;
        self.write_record(
            self.lock_path("profile", &profile.user_id),
            self.profile_path(&profile.user_id),
            bytes,
        )
        .await?;

        debug!(user.id = %profile.user_id, "Behavior profile saved");
        Ok(())
    }
}

/// File name for an opaque identifier. Every byte outside `[A-Za-z0-9-]` is
/// hex escaped, which keeps distinct identifiers distinct.
pub fn record_key(raw: &str) -> String {
    let mut key = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            key.push(byte as char);
        } else {
            key.push_str(&format!("_{:02x}", byte));
        }
    }
    key
}

fn open_lock_file(lock_path: &Path) -> Result<File, PersistenceError> {
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(lock_path)
        .map_err(|e| PersistenceError::LockError {
            reason: format!("{}: {}", lock_path.display(), e),
        })
}

/// Replace `target` with `bytes` while holding the record's exclusive lock.
/// A crash before the rename leaves the previous record intact.
fn write_atomically(lock_path: &Path, target: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
    let mut lock = RwLock::new(open_lock_file(lock_path)?);
    let _guard = lock.write().map_err(|e| PersistenceError::LockError {
        reason: format!("{}: {}", lock_path.display(), e),
    })?;

    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let temp_path = target.with_extension("json.tmp");
    {
        let mut temp = File::create(&temp_path)?;
        temp.write_all(bytes)?;
        temp.sync_all()?;
    }
    std::fs::rename(&temp_path, target)?;
    Ok(())
}

fn remove_locked(lock_path: &Path, target: &Path) -> Result<bool, PersistenceError> {
    let mut lock = RwLock::new(open_lock_file(lock_path)?);
    let _guard = lock.write().map_err(|e| PersistenceError::LockError {
        reason: format!("{}: {}", lock_path.display(), e),
    })?;

    match std::fs::remove_file(target) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
