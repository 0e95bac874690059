//! Bounded reclamation of expired deals
//!
//! A pass handles at most a fixed number of due deals. Any backlog beyond that
//! is left to a deferred continuation, queued by [`Sweeper::schedule_if_due`],
//! so no single invocation does work proportional to the number of expired
//! deals.
use crate::config::EscrowConfig;
use crate::deal::TimeStamp;
use crate::machine::DealMachine;
use crate::scheduler::SweepTask;
use crate::store::{self, Changeset, DealStore};
use anyhow::Context;
use chrono::Utc;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Deals deleted, with any refund queued.
    pub reclaimed: Vec<u64>,
    /// Delivered deals locked for arbitration.
    pub locked: Vec<u64>,
}

impl SweepReport {
    pub fn processed(&self) -> usize {
        self.reclaimed.len() + self.locked.len()
    }
}

pub struct Sweeper<'a> {
    store: &'a DealStore,
    config: &'a EscrowConfig,
}

impl<'a> Sweeper<'a> {
    pub fn new(store: &'a DealStore, config: &'a EscrowConfig) -> Self {
        Self { store, config }
    }

    /// Resolves up to `limit` due deals into `changeset`.
    pub fn sweep(&self, changeset: &mut Changeset, now: TimeStamp<Utc>, limit: u32) -> anyhow::Result<SweepReport> {
        let machine = DealMachine::new(self.config);
        let mut report = SweepReport::default();

        for key in changeset.due_keys(self.store, now, limit as usize)? {
            let id = store::expiry_key_id(&key);
            let Some(deal) = changeset.get(self.store, id)? else {
                tracing::warn!(deal_id = id, "expiry index points at a missing deal, dropping the entry");
                changeset.drop_index_entry(key);
                continue;
            };
            let transition = machine.expire(&deal);
            changeset.stage(Some(&deal), &transition);

            if transition.outcome.is_removed() {
                tracing::info!(deal_id = id, funded = deal.is_funded(), "expired deal reclaimed");
                report.reclaimed.push(id);
            } else {
                tracing::info!(deal_id = id, "delivered deal expired, open for arbitration");
                report.locked.push(id);
            }
        }

        Ok(report)
    }

    /// Queues a deferred sweep when due work is left after `changeset` commits.
    /// The task is keyed by the earliest due deal, so every trigger that sees
    /// the same backlog collapses into one pending task.
    pub fn schedule_if_due(&self, changeset: &mut Changeset, now: TimeStamp<Utc>) -> anyhow::Result<Option<SweepTask>> {
        let Some(first) = changeset.due(self.store, now, 1)?.into_iter().next() else {
            return Ok(None);
        };

        let not_before = now
            .checked_add(self.config.sweep_delay)
            .context("deferred sweep falls past the last representable instant")?;
        let task = SweepTask::new(first, not_before, self.config.sweep_batch);
        tracing::debug!(key = first, not_before = %task.not_before, "deferred sweep scheduled");
        changeset.schedule(task);
        Ok(Some(task))
    }
}
