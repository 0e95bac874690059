//! Persistent deal store
//!
//! Four sled trees make up the store: deals by id, the expiry-ordered index,
//! the effect outbox, and pending sweep tasks. Every invocation stages its
//! writes in a [`Changeset`], which can be read through, and commits them in a
//! single multi-tree transaction so the index, the records, the queued effects
//! and the scheduled sweeps never disagree.
use crate::deal::{Deal, Expiry, TimeStamp};
use crate::effect::Effect;
use crate::error::{EscrowError, StateError};
use crate::machine::{Outcome, Transition};
use crate::scheduler::SweepTask;
use anyhow::Context;
use chrono::Utc;
use sled::Transactional;
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult, TransactionError};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

const DEALS_TREE: &str = "deals";
const EXPIRY_TREE: &str = "deals_by_expiry";
const OUTBOX_TREE: &str = "outbox";
const TASKS_TREE: &str = "sweep_tasks";

/// Index key: big-endian expiry nanos followed by the big-endian deal id.
pub type ExpiryKey = [u8; 16];

pub fn expiry_key(expiry: Expiry, id: u64) -> ExpiryKey {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&expiry.index_nanos().to_be_bytes());
    key[8..].copy_from_slice(&id.to_be_bytes());
    key
}

pub fn expiry_key_id(key: &ExpiryKey) -> u64 {
    split_key(key).map(|(_, id)| id).unwrap_or_default()
}

fn split_key(key: &[u8]) -> Option<(u64, u64)> {
    let nanos = u64::from_be_bytes(key.get(..8)?.try_into().ok()?);
    let id = u64::from_be_bytes(key.get(8..16)?.try_into().ok()?);
    Some((nanos, id))
}

// first key past the lock sentinel
fn first_unlocked_key() -> ExpiryKey {
    let mut key = [0u8; 16];
    key[7] = 1;
    key
}

#[derive(Clone)]
pub struct DealStore {
    db: Arc<sled::Db>,
    deals: sled::Tree,
    expiry: sled::Tree,
    outbox: sled::Tree,
    tasks: sled::Tree,
}

/// Writes staged by one invocation, applied all together by [`DealStore::commit`].
/// Each staged deal remembers the record it was decided from; the commit fails
/// with [`StateError::Stale`] if the stored record no longer matches.
#[derive(Debug, Default)]
pub struct Changeset {
    deals: BTreeMap<u64, Option<Deal>>,
    read: BTreeMap<u64, Option<Deal>>,
    index_added: BTreeSet<ExpiryKey>,
    index_removed: BTreeSet<ExpiryKey>,
    effects: Vec<Effect>,
    scheduled: BTreeMap<u64, SweepTask>,
    consumed: BTreeSet<u64>,
}

impl DealStore {
    pub fn open(db: Arc<sled::Db>) -> anyhow::Result<Self> {
        Ok(Self {
            deals: db.open_tree(DEALS_TREE)?,
            expiry: db.open_tree(EXPIRY_TREE)?,
            outbox: db.open_tree(OUTBOX_TREE)?,
            tasks: db.open_tree(TASKS_TREE)?,
            db,
        })
    }

    pub fn get(&self, id: u64) -> anyhow::Result<Option<Deal>> {
        match self.deals.get(id.to_be_bytes())? {
            Some(bytes) => {
                let deal = minicbor::decode(&bytes).with_context(|| format!("decoding deal {id}"))?;
                Ok(Some(deal))
            }
            None => Ok(None),
        }
    }

    pub fn contains(&self, id: u64) -> anyhow::Result<bool> {
        Ok(self.deals.contains_key(id.to_be_bytes())?)
    }

    /// All live deals in id order.
    pub fn deals(&self) -> anyhow::Result<Vec<Deal>> {
        self.deals
            .iter()
            .values()
            .map(|bytes| Ok(minicbor::decode(&bytes?)?))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.deals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deals.is_empty()
    }

    /// Ids in expiry order, locked deals first.
    pub fn ids_by_expiry(&self) -> anyhow::Result<Vec<u64>> {
        self.expiry
            .iter()
            .keys()
            .map(|key| {
                let key = key?;
                split_key(&key)
                    .map(|(_, id)| id)
                    .context("malformed expiry index key")
            })
            .collect()
    }

    /// True when the expiry index holds exactly one entry per deal, at the
    /// deal's current expiry.
    pub fn index_is_consistent(&self) -> anyhow::Result<bool> {
        if self.expiry.len() != self.deals.len() {
            return Ok(false);
        }
        for deal in self.deals()? {
            if !self.expiry.contains_key(expiry_key(deal.expires(), deal.id()))? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Pending sweep tasks in key order.
    pub fn tasks(&self) -> anyhow::Result<Vec<SweepTask>> {
        self.tasks
            .iter()
            .values()
            .map(|bytes| Ok(minicbor::decode(&bytes?)?))
            .collect()
    }

    /// Queued effects in the order they were committed.
    pub fn outbox(&self) -> anyhow::Result<Vec<(u64, Effect)>> {
        self.outbox
            .iter()
            .map(|entry| {
                let (key, bytes) = entry?;
                let seq = u64::from_be_bytes(key.as_ref().try_into().context("malformed outbox key")?);
                Ok((seq, minicbor::decode(&bytes)?))
            })
            .collect()
    }

    pub fn remove_outbox(&self, seq: u64) -> anyhow::Result<()> {
        self.outbox.remove(seq.to_be_bytes())?;
        Ok(())
    }

    fn committed_due(&self, now: TimeStamp<Utc>, skip: &BTreeSet<ExpiryKey>, limit: usize) -> anyhow::Result<Vec<ExpiryKey>> {
        let horizon = now.index_nanos();
        let mut due = Vec::new();
        for key in self.expiry.range(first_unlocked_key()..).keys() {
            if due.len() >= limit {
                break;
            }
            let key = key?;
            let (nanos, _) = split_key(&key).context("malformed expiry index key")?;
            if nanos > horizon {
                break;
            }
            let key: ExpiryKey = key.as_ref().try_into().context("malformed expiry index key")?;
            if !skip.contains(&key) {
                due.push(key);
            }
        }
        Ok(due)
    }

    pub fn commit(&self, changeset: Changeset) -> anyhow::Result<()> {
        let mut deal_writes = Vec::with_capacity(changeset.deals.len());
        for (id, deal) in &changeset.deals {
            let bytes = deal.as_ref().map(minicbor::to_vec).transpose()?;
            deal_writes.push((id.to_be_bytes(), bytes));
        }
        let mut expected = Vec::with_capacity(changeset.read.len());
        for (id, deal) in &changeset.read {
            let bytes = deal.as_ref().map(minicbor::to_vec).transpose()?;
            expected.push((*id, bytes));
        }
        let mut outbox_writes = Vec::with_capacity(changeset.effects.len());
        for effect in &changeset.effects {
            outbox_writes.push((self.db.generate_id()?.to_be_bytes(), minicbor::to_vec(effect)?));
        }
        let mut task_writes = Vec::with_capacity(changeset.scheduled.len());
        for (key, task) in &changeset.scheduled {
            task_writes.push((key.to_be_bytes(), minicbor::to_vec(task)?));
        }

        (&self.deals, &self.expiry, &self.outbox, &self.tasks)
            .transaction(
                |(deals, expiry, outbox, tasks)| -> ConflictableTransactionResult<(), u64> {
                    for (id, bytes) in &expected {
                        let current = deals.get(&id.to_be_bytes()[..])?;
                        if current.as_deref() != bytes.as_deref() {
                            return Err(ConflictableTransactionError::Abort(*id));
                        }
                    }
                    for (key, bytes) in &deal_writes {
                        match bytes {
                            Some(bytes) => deals.insert(&key[..], bytes.as_slice())?,
                            None => deals.remove(&key[..])?,
                        };
                    }
                    for key in &changeset.index_removed {
                        expiry.remove(&key[..])?;
                    }
                    for key in &changeset.index_added {
                        expiry.insert(&key[..], sled::IVec::default())?;
                    }
                    for (key, bytes) in &outbox_writes {
                        outbox.insert(&key[..], bytes.as_slice())?;
                    }
                    for key in &changeset.consumed {
                        tasks.remove(&key.to_be_bytes()[..])?;
                    }
                    // a key already pending keeps its original task
                    for (key, bytes) in &task_writes {
                        if tasks.get(&key[..])?.is_none() {
                            tasks.insert(&key[..], bytes.as_slice())?;
                        }
                    }
                    Ok(())
                },
            )
            .map_err(|e| match e {
                TransactionError::Abort(id) => anyhow::Error::new(EscrowError::from(StateError::Stale(id))),
                TransactionError::Storage(e) => anyhow::Error::new(e).context("committing deal changeset"),
            })
    }
}

impl Changeset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages the record change and the effects of `transition`. `before` is the
    /// record as it was loaded, `None` for a creation.
    pub fn stage(&mut self, before: Option<&Deal>, transition: &Transition) {
        let id = transition.deal().id();
        if !self.deals.contains_key(&id) {
            self.read.entry(id).or_insert_with(|| before.cloned());
        }
        if let Some(before) = before {
            self.unindex(expiry_key(before.expires(), before.id()));
        }
        match &transition.outcome {
            Outcome::Created(deal) | Outcome::Updated(deal) => {
                self.index(expiry_key(deal.expires(), deal.id()));
                self.deals.insert(deal.id(), Some(deal.clone()));
            }
            Outcome::Removed(deal) => {
                self.deals.insert(deal.id(), None);
            }
        }
        self.effects.extend(transition.effects.iter().cloned());
    }

    fn index(&mut self, key: ExpiryKey) {
        if !self.index_removed.remove(&key) {
            self.index_added.insert(key);
        }
    }

    fn unindex(&mut self, key: ExpiryKey) {
        if !self.index_added.remove(&key) {
            self.index_removed.insert(key);
        }
    }

    /// Reads a deal through the staged writes.
    pub fn get(&self, store: &DealStore, id: u64) -> anyhow::Result<Option<Deal>> {
        match self.deals.get(&id) {
            Some(staged) => Ok(staged.clone()),
            None => store.get(id),
        }
    }

    /// Removes an index entry with no record behind it.
    pub fn drop_index_entry(&mut self, key: ExpiryKey) {
        self.unindex(key);
    }

    /// Up to `limit` ids of unlocked deals due at `now`, earliest first, as the
    /// store would hold them after this changeset commits.
    pub fn due(&self, store: &DealStore, now: TimeStamp<Utc>, limit: usize) -> anyhow::Result<Vec<u64>> {
        Ok(self.due_keys(store, now, limit)?.iter().map(expiry_key_id).collect())
    }

    /// Index keys behind [`Changeset::due`].
    pub fn due_keys(&self, store: &DealStore, now: TimeStamp<Utc>, limit: usize) -> anyhow::Result<Vec<ExpiryKey>> {
        let horizon = now.index_nanos();
        let mut keys = store.committed_due(now, &self.index_removed, limit)?;
        keys.extend(self.index_added.iter().copied().filter(|key| {
            split_key(key).is_some_and(|(nanos, _)| nanos != 0 && nanos <= horizon)
        }));
        keys.sort_unstable();
        keys.dedup();
        keys.truncate(limit);
        Ok(keys)
    }

    pub fn schedule(&mut self, task: SweepTask) {
        self.scheduled.entry(task.key).or_insert(task);
    }

    pub fn consume_task(&mut self, key: u64) {
        self.consumed.insert(key);
    }

    pub fn effects(&self) -> &[Effect] {
        &self.effects
    }

    pub fn scheduled(&self) -> impl Iterator<Item = &SweepTask> {
        self.scheduled.values()
    }
}
