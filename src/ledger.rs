//! Interfaces to the host ledger: accounts, token transfers and the audit bus
use crate::asset::{ExtendedAsset, Symbol};
use crate::deal::PartyId;
use crate::effect::Notification;
use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Moves tokens out of the custodian's holdings. Settlement is the ledger's
/// concern; an `Err` only means the request could not be handed over.
pub trait PaymentGateway {
    fn transfer(&self, from: &PartyId, to: &PartyId, asset: &ExtendedAsset, memo: &str) -> anyhow::Result<()>;
}

/// Append-only sink for audit records.
pub trait NotificationBus {
    fn publish(&self, notification: &Notification) -> anyhow::Result<()>;
}

pub trait AccountOracle {
    fn is_account(&self, account: &PartyId) -> bool;
    /// Whether `account` holds a balance row of `symbol` on `contract`.
    fn has_balance(&self, account: &PartyId, contract: &PartyId, symbol: &Symbol) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub from: PartyId,
    pub to: PartyId,
    pub asset: ExtendedAsset,
    pub memo: String,
}

/// A ledger held in memory, standing in for the host in tests and demos.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    accounts: Mutex<HashSet<PartyId>>,
    balance_rows: Mutex<HashSet<(PartyId, PartyId, Symbol)>>,
    transfers: Mutex<Vec<Transfer>>,
    notifications: Mutex<Vec<Notification>>,
    reject_transfers: AtomicBool,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn add_account(&self, account: PartyId) {
        lock(&self.accounts).insert(account);
    }
    pub fn add_balance_row(&self, account: PartyId, contract: PartyId, symbol: Symbol) {
        lock(&self.balance_rows).insert((account, contract, symbol));
    }
    /// While set, every transfer request is refused.
    pub fn reject_transfers(&self, reject: bool) {
        self.reject_transfers.store(reject, Ordering::SeqCst);
    }
    pub fn transfers(&self) -> Vec<Transfer> {
        lock(&self.transfers).clone()
    }
    pub fn notifications(&self) -> Vec<Notification> {
        lock(&self.notifications).clone()
    }
    /// Sum of amounts received by `account`, across all symbols.
    pub fn received_by(&self, account: &PartyId) -> i64 {
        lock(&self.transfers)
            .iter()
            .filter(|t| &t.to == account)
            .map(|t| t.asset.quantity.amount)
            .sum()
    }
}

// A poisoned lock only means another test thread panicked; the data is still usable.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PaymentGateway for InMemoryLedger {
    fn transfer(&self, from: &PartyId, to: &PartyId, asset: &ExtendedAsset, memo: &str) -> anyhow::Result<()> {
        if self.reject_transfers.load(Ordering::SeqCst) {
            anyhow::bail!("transfer of {asset} to {to} rejected");
        }
        lock(&self.transfers).push(Transfer {
            from: from.clone(),
            to: to.clone(),
            asset: asset.clone(),
            memo: memo.to_string(),
        });
        Ok(())
    }
}

impl NotificationBus for InMemoryLedger {
    fn publish(&self, notification: &Notification) -> anyhow::Result<()> {
        lock(&self.notifications).push(notification.clone());
        Ok(())
    }
}

impl AccountOracle for InMemoryLedger {
    fn is_account(&self, account: &PartyId) -> bool {
        lock(&self.accounts).contains(account)
    }
    fn has_balance(&self, account: &PartyId, contract: &PartyId, symbol: &Symbol) -> bool {
        lock(&self.balance_rows).contains(&(account.clone(), contract.clone(), symbol.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::Quantity;

    #[test]
    fn records_transfers_until_rejected() {
        let ledger = InMemoryLedger::new();
        let asset = ExtendedAsset::new(
            "eosio.token".into(),
            Quantity::new(5, Symbol::new("EOS", 4)),
        );

        ledger.transfer(&"escrow".into(), &"bob".into(), &asset, "memo").unwrap();
        assert_eq!(ledger.received_by(&"bob".into()), 5);

        ledger.reject_transfers(true);
        assert!(ledger.transfer(&"escrow".into(), &"bob".into(), &asset, "memo").is_err());
        assert_eq!(ledger.transfers().len(), 1);
    }

    #[test]
    fn balance_rows_are_per_contract_and_symbol() {
        let ledger = InMemoryLedger::new();
        ledger.add_balance_row("alice".into(), "eosio.token".into(), Symbol::new("EOS", 4));

        assert!(ledger.has_balance(&"alice".into(), &"eosio.token".into(), &Symbol::new("EOS", 4)));
        assert!(!ledger.has_balance(&"alice".into(), &"other.token".into(), &Symbol::new("EOS", 4)));
        assert!(!ledger.has_balance(&"alice".into(), &"eosio.token".into(), &Symbol::new("SYS", 4)));
    }
}
