use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Longest interval honoured; larger values are clamped
const MAX_INTERVAL_SECONDS: u64 = 100 * 365 * 24 * 60 * 60;

/// Time-gated save trigger, evaluated lazily on every mutation.
///
/// This is a debounce, not a guarantee: a mutation that lands inside the
/// interval is only durable once a later save goes through.
#[derive(Debug)]
pub struct AutoSaveScheduler {
    interval: Duration,
    last_saved: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl AutoSaveScheduler {
    pub fn new(interval_seconds: u64) -> Self {
        Self {
            interval: Duration::seconds(interval_seconds.min(MAX_INTERVAL_SECONDS) as i64),
            last_saved: Mutex::new(HashMap::new()),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// A workflow never saved by this process is always due
    pub async fn is_due(&self, workflow_id: &str, now: DateTime<Utc>) -> bool {
        match self.last_saved.lock().await.get(workflow_id) {
            Some(last) => now - *last >= self.interval,
            None => true,
        }
    }

    pub async fn mark_saved(&self, workflow_id: &str, at: DateTime<Utc>) {
        self.last_saved.lock().await.insert(workflow_id.to_string(), at);
    }

    pub async fn last_saved(&self, workflow_id: &str) -> Option<DateTime<Utc>> {
        self.last_saved.lock().await.get(workflow_id).copied()
    }

    pub async fn forget(&self, workflow_id: &str) {
        self.last_saved.lock().await.remove(workflow_id);
    }
}
