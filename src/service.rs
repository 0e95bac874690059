//! Service layer API for escrow deal operations
//!
//! Every entry point follows the same path: authenticate the signer, load the
//! deal, let [`DealMachine`] decide, stage the outcome, run the sweeper's tail
//! check and commit everything in one transaction.
use crate::asset::Quantity;
use crate::config::EscrowConfig;
use crate::deal::{Deal, DealTerms, PartyId, TimeStamp};
use crate::error::{AuthError, EscrowError, StateError, ValidationError};
use crate::ledger::{AccountOracle, NotificationBus, PaymentGateway};
use crate::machine::{DealMachine, Funding, MachineResult, Transition};
use crate::outbox::{DispatchReport, Outbox};
use crate::scheduler::{self, SweepTask};
use crate::store::{Changeset, DealStore};
use crate::sweeper::{SweepReport, Sweeper};
use crate::utils;
use chrono::Utc;
use std::sync::Arc;

/// Context of one call: who signed it, when it runs, and the content of the
/// enclosing transaction (the source of new deal ids).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub signer: PartyId,
    pub now: TimeStamp<Utc>,
    pub tx_content: Vec<u8>,
}

impl Invocation {
    pub fn new(signer: PartyId, now: TimeStamp<Utc>, tx_content: impl Into<Vec<u8>>) -> Self {
        Self {
            signer,
            now,
            tx_content: tx_content.into(),
        }
    }

    /// An invocation carrying a fresh random nonce as its transaction content.
    pub fn unique(signer: PartyId, now: TimeStamp<Utc>) -> anyhow::Result<Self> {
        let nonce = utils::new_uuid_to_bech32("tx")?;
        Ok(Self::new(signer, now, nonce))
    }
}

/// Tokens arriving at an account, as reported by the token ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenTransfer {
    pub contract: PartyId,
    pub from: PartyId,
    pub to: PartyId,
    pub quantity: Quantity,
    pub memo: String,
}

/// What an invocation committed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Receipt {
    pub transition: Option<Transition>,
    pub sweep: Option<SweepReport>,
    /// Deferred sweep requested by the tail check. A task already pending
    /// under the same key is kept instead.
    pub scheduled: Option<SweepTask>,
}

impl Receipt {
    pub fn deal(&self) -> Option<&Deal> {
        self.transition.as_ref().map(Transition::deal)
    }
}

/// Invocations are meant to be serialized by the host. When two overlap on
/// one deal, the later commit fails with [`StateError::Stale`] and writes
/// nothing.
pub struct EscrowService {
    store: DealStore,
    config: EscrowConfig,
    oracle: Arc<dyn AccountOracle + Send + Sync>,
}

impl EscrowService {
    pub fn new(
        instance: Arc<sled::Db>,
        config: EscrowConfig,
        oracle: Arc<dyn AccountOracle + Send + Sync>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            store: DealStore::open(instance)?,
            config,
            oracle,
        })
    }

    pub fn config(&self) -> &EscrowConfig {
        &self.config
    }

    pub fn store(&self) -> &DealStore {
        &self.store
    }

    pub fn deal(&self, id: u64) -> anyhow::Result<Option<Deal>> {
        self.store.get(id)
    }

    pub fn deals(&self) -> anyhow::Result<Vec<Deal>> {
        self.store.deals()
    }

    pub fn outbox(&self) -> Outbox<'_> {
        Outbox::new(&self.store, &self.config.custodian)
    }

    /// Propose a new deal
    pub fn new_deal(&self, inv: &Invocation, creator: &PartyId, terms: &DealTerms) -> anyhow::Result<Receipt> {
        require_signer(inv, creator)?;

        let machine = DealMachine::new(&self.config);
        let transition = machine.create(self.oracle.as_ref(), creator, terms, &inv.tx_content, inv.now)?;
        let id = transition.deal().id();

        let mut changeset = Changeset::new();
        if changeset.get(&self.store, id)?.is_some() {
            return Err(EscrowError::from(StateError::IdCollision(id)).into());
        }
        changeset.stage(None, &transition);
        tracing::info!(deal_id = id, creator = %creator, "deal proposed");

        self.finish(inv, changeset, Some(transition), None)
    }

    pub fn accept(&self, inv: &Invocation, party: &PartyId, id: u64) -> anyhow::Result<Receipt> {
        require_signer(inv, party)?;
        self.apply(inv, id, "accept", |machine, deal| machine.accept(deal, party, inv.now))
    }

    /// Handles tokens received by any account this service watches. Transfers
    /// not addressed to the custodian are none of its business.
    pub fn on_transfer(&self, inv: &Invocation, transfer: &TokenTransfer) -> anyhow::Result<Option<Receipt>> {
        if transfer.to != self.config.custodian {
            return Ok(None);
        }
        require_signer(inv, &transfer.from)?;

        let memo = transfer.memo.trim();
        if memo.is_empty() {
            return Err(EscrowError::from(ValidationError::MissingMemo).into());
        }
        let id = utils::parse_memo(memo)
            .ok_or_else(|| EscrowError::from(ValidationError::MalformedMemo(memo.to_string())))?;

        let funding = Funding {
            from: &transfer.from,
            contract: &transfer.contract,
            quantity: &transfer.quantity,
        };
        let receipt = self.apply(inv, id, "fund", |machine, deal| machine.fund(deal, funding, inv.now))?;
        Ok(Some(receipt))
    }

    pub fn delivered(&self, inv: &Invocation, id: u64) -> anyhow::Result<Receipt> {
        self.apply(inv, id, "delivered", |machine, deal| machine.deliver(deal, &inv.signer, inv.now))
    }

    pub fn goods_received(&self, inv: &Invocation, id: u64) -> anyhow::Result<Receipt> {
        self.apply(inv, id, "goods_received", |machine, deal| machine.goods_received(deal, &inv.signer))
    }

    pub fn cancel(&self, inv: &Invocation, id: u64) -> anyhow::Result<Receipt> {
        self.apply(inv, id, "cancel", |machine, deal| machine.cancel(deal, &inv.signer))
    }

    pub fn extend(&self, inv: &Invocation, id: u64, more_days: u32) -> anyhow::Result<Receipt> {
        self.apply(inv, id, "extend", |machine, deal| machine.extend(deal, &inv.signer, more_days))
    }

    pub fn arb_refund(&self, inv: &Invocation, id: u64) -> anyhow::Result<Receipt> {
        self.apply(inv, id, "arb_refund", |machine, deal| machine.arbitrate(deal, &inv.signer, true))
    }

    pub fn arb_enforce(&self, inv: &Invocation, id: u64) -> anyhow::Result<Receipt> {
        self.apply(inv, id, "arb_enforce", |machine, deal| machine.arbitrate(deal, &inv.signer, false))
    }

    /// Reclaims up to `count` expired deals, never more than one deferred batch.
    /// Only the custodian may run it.
    pub fn wipe_expired(&self, inv: &Invocation, count: u32) -> anyhow::Result<Receipt> {
        if inv.signer != self.config.custodian {
            return Err(EscrowError::from(AuthError::SystemOnly).into());
        }
        self.sweep_with(inv, Changeset::new(), count.min(self.config.sweep_batch))
    }

    /// Reclaims expired deals on anyone's request, bounded by the manual batch.
    pub fn sweep(&self, inv: &Invocation) -> anyhow::Result<Receipt> {
        self.sweep_with(inv, Changeset::new(), self.config.manual_sweep_batch)
    }

    /// Runs every deferred sweep that is due at `now`, each as its own
    /// invocation signed by the custodian. Each task is consumed by the same
    /// commit that applies its batch.
    pub fn run_scheduled(&self, now: TimeStamp<Utc>) -> anyhow::Result<Vec<SweepReport>> {
        let mut reports = Vec::new();
        for task in scheduler::due_tasks(&self.store, now)? {
            let inv = Invocation::new(self.config.custodian.clone(), now, task.key.to_be_bytes());
            let mut changeset = Changeset::new();
            changeset.consume_task(task.key);

            tracing::debug!(key = task.key, batch = task.batch_limit, "running deferred sweep");
            let receipt = self.sweep_with(&inv, changeset, task.batch_limit)?;
            reports.extend(receipt.sweep);
        }
        Ok(reports)
    }

    /// Hands queued payments and notifications to the outside world.
    pub fn dispatch(&self, gateway: &dyn PaymentGateway, bus: &dyn NotificationBus) -> anyhow::Result<DispatchReport> {
        self.outbox().dispatch(gateway, bus)
    }

    fn apply<F>(&self, inv: &Invocation, id: u64, action: &str, decide: F) -> anyhow::Result<Receipt>
    where
        F: FnOnce(&DealMachine<'_>, &Deal) -> MachineResult<Transition>,
    {
        let mut changeset = Changeset::new();
        let deal = changeset
            .get(&self.store, id)?
            .ok_or_else(|| EscrowError::from(StateError::NotFound(id)))?;

        let machine = DealMachine::new(&self.config);
        let transition = match decide(&machine, &deal) {
            Ok(transition) => transition,
            Err(e) => {
                tracing::debug!(deal_id = id, action, signer = %inv.signer, error = %e, "transition rejected");
                return Err(e.into());
            }
        };
        changeset.stage(Some(&deal), &transition);
        tracing::info!(
            deal_id = id,
            action,
            state = ?transition.deal().state(),
            removed = transition.outcome.is_removed(),
            "deal updated"
        );

        self.finish(inv, changeset, Some(transition), None)
    }

    fn sweep_with(&self, inv: &Invocation, mut changeset: Changeset, limit: u32) -> anyhow::Result<Receipt> {
        let report = Sweeper::new(&self.store, &self.config).sweep(&mut changeset, inv.now, limit)?;
        self.finish(inv, changeset, None, Some(report))
    }

    fn finish(
        &self,
        inv: &Invocation,
        mut changeset: Changeset,
        transition: Option<Transition>,
        sweep: Option<SweepReport>,
    ) -> anyhow::Result<Receipt> {
        let scheduled = Sweeper::new(&self.store, &self.config).schedule_if_due(&mut changeset, inv.now)?;
        self.store.commit(changeset)?;

        Ok(Receipt {
            transition,
            sweep,
            scheduled,
        })
    }
}

fn require_signer(inv: &Invocation, party: &PartyId) -> Result<(), EscrowError> {
    if &inv.signer != party {
        return Err(AuthError::MissingAuthority {
            signer: inv.signer.to_string(),
            party: party.to_string(),
        }
        .into());
    }
    Ok(())
}
