//! In-memory record of in-flight and recently finished requests.
//!
//! Diagnostics only: nothing reads the ledger to make decisions. Records are
//! dropped by a fixed-delay removal after they finish and by a periodic sweep
//! that removes anything older than a maximum age, whatever its status.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::tasks::{spawn_periodic, TaskHandle};
use crate::util::now_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Processing,
    Completed,
    Failed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Processing => "processing",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestRecord {
    pub id: String,
    pub status: RequestStatus,
    pub started_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RequestRecord {
    pub fn processing(id: impl Into<String>, started_ms: u64) -> Self {
        Self {
            id: id.into(),
            status: RequestStatus::Processing,
            started_ms,
            duration_ms: None,
            error: None,
        }
    }
}

#[derive(Default)]
pub struct RequestLedger {
    records: Mutex<HashMap<String, RequestRecord>>,
    seq: AtomicU64,
}

impl RequestLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// `<sender>_<millis>_<seq>`; the process-local sequence keeps ids from
    /// colliding when one sender sends twice within the same millisecond.
    pub fn next_id(&self, sender: &str, now_ms: u64) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("{sender}_{now_ms}_{seq}")
    }

    pub fn upsert(&self, record: RequestRecord) {
        if let Ok(mut map) = self.records.lock() {
            map.insert(record.id.clone(), record);
        }
    }

    pub fn mark_completed(&self, id: &str, duration_ms: u64) {
        self.finish(id, RequestStatus::Completed, duration_ms, None);
    }

    pub fn mark_failed(&self, id: &str, error: impl Into<String>, duration_ms: u64) {
        self.finish(id, RequestStatus::Failed, duration_ms, Some(error.into()));
    }

    fn finish(&self, id: &str, status: RequestStatus, duration_ms: u64, error: Option<String>) {
        if let Ok(mut map) = self.records.lock() {
            let record = map.entry(id.to_string()).or_insert_with(|| {
                RequestRecord::processing(id, now_millis().saturating_sub(duration_ms))
            });
            record.status = status;
            record.duration_ms = Some(duration_ms);
            record.error = error;
        }
    }

    pub fn remove(&self, id: &str) -> Option<RequestRecord> {
        self.records.lock().ok().and_then(|mut map| map.remove(id))
    }

    pub fn get(&self, id: &str) -> Option<RequestRecord> {
        self.records.lock().ok().and_then(|map| map.get(id).cloned())
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sweep(&self, max_age: Duration) -> usize {
        self.sweep_at(now_millis(), max_age)
    }

    /// Removes every record started more than `max_age` before `now_ms`.
    pub fn sweep_at(&self, now_ms: u64, max_age: Duration) -> usize {
        let max_age_ms = max_age.as_millis() as u64;
        let Ok(mut map) = self.records.lock() else {
            return 0;
        };
        let before = map.len();
        map.retain(|_, record| now_ms.saturating_sub(record.started_ms) <= max_age_ms);
        before - map.len()
    }

    pub fn schedule_removal(self: &Arc<Self>, id: &str, delay: Duration) {
        let ledger = Arc::clone(self);
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            ledger.remove(&id);
        });
    }

    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, max_age: Duration) -> TaskHandle {
        let ledger = Arc::clone(self);
        spawn_periodic("ledger.sweep", interval, move || {
            let ledger = Arc::clone(&ledger);
            async move {
                let removed = ledger.sweep(max_age);
                if removed > 0 {
                    debug!(target: "pkgbot::ledger", removed, remaining = ledger.len(), "swept stale request records");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_removes_old_records_regardless_of_status() {
        let ledger = RequestLedger::new();
        let now = 10_000_000;
        ledger.upsert(RequestRecord::processing("stale", now - 700_000));
        ledger.upsert(RequestRecord::processing("fresh", now - 1_000));
        ledger.upsert(RequestRecord::processing("done", now - 700_000));
        ledger.mark_completed("done", 5);

        let removed = ledger.sweep_at(now, Duration::from_millis(600_000));
        assert_eq!(removed, 2);
        assert!(ledger.get("stale").is_none());
        assert!(ledger.get("done").is_none());
        assert!(ledger.get("fresh").is_some());
    }

    #[test]
    fn finishing_keeps_start_time() {
        let ledger = RequestLedger::new();
        ledger.upsert(RequestRecord::processing("r1", 42));
        ledger.mark_failed("r1", "fetch service unreachable", 17);
        let record = ledger.get("r1").unwrap();
        assert_eq!(record.status, RequestStatus::Failed);
        assert_eq!(record.started_ms, 42);
        assert_eq!(record.duration_ms, Some(17));
        assert_eq!(record.error.as_deref(), Some("fetch service unreachable"));
    }

    #[test]
    fn ids_stay_distinct_within_one_millisecond() {
        let ledger = RequestLedger::new();
        let a = ledger.next_id("123@s.whatsapp.net", 1_700_000_000_000);
        let b = ledger.next_id("123@s.whatsapp.net", 1_700_000_000_000);
        assert_ne!(a, b);
        assert!(a.starts_with("123@s.whatsapp.net_1700000000000_"));
    }

    #[tokio::test]
    async fn scheduled_removal_fires_after_delay() {
        let ledger = Arc::new(RequestLedger::new());
        ledger.upsert(RequestRecord::processing("r1", now_millis()));
        ledger.schedule_removal("r1", Duration::from_millis(30));
        assert!(ledger.get("r1").is_some());
        for _ in 0..100 {
            if ledger.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(ledger.is_empty());
    }
}
