//! Deferred sweep tasks
//!
//! A sweep that cannot run inline is queued as a [`SweepTask`] keyed by the id
//! of the deal that made it necessary. Keys deduplicate: while a task for a key
//! is pending, further requests for the same key collapse into it.
use crate::deal::TimeStamp;
use crate::store::DealStore;
use chrono::Utc;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepTask {
    #[n(0)]
    pub key: u64,
    #[n(1)]
    pub not_before: TimeStamp<Utc>,
    #[n(2)]
    pub batch_limit: u32,
}

impl SweepTask {
    pub fn new(key: u64, not_before: TimeStamp<Utc>, batch_limit: u32) -> Self {
        Self {
            key,
            not_before,
            batch_limit,
        }
    }
    pub fn is_due(&self, now: TimeStamp<Utc>) -> bool {
        self.not_before <= now
    }
}

/// Pending tasks that may run at `now`, earliest first.
pub fn due_tasks(store: &DealStore, now: TimeStamp<Utc>) -> anyhow::Result<Vec<SweepTask>> {
    let mut due: Vec<_> = store
        .tasks()?
        .into_iter()
        .filter(|task| task.is_due(now))
        .collect();
    due.sort_by_key(|task| (task.not_before, task.key));
    Ok(due)
}
