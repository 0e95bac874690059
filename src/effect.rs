//! Side effects a transition asks the environment to perform
use crate::asset::{ExtendedAsset, Quantity};
use crate::deal::{Deal, PartyId};
use std::fmt;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DealStatus {
    #[n(0)]
    Created,
    #[n(1)]
    FullyAccepted,
    #[n(2)]
    Funded,
    #[n(3)]
    Delivered,
    #[n(4)]
    Closed,
    #[n(5)]
    Refunded,
    #[n(6)]
    Canceled,
    #[n(7)]
    Extended,
    #[n(8)]
    Arbitration,
    #[n(9)]
    ArbRefunded,
    #[n(10)]
    ArbEnforced,
    #[n(11)]
    Expired,
}

/// Audit record of one state change, carrying a full snapshot of the deal and
/// the parties that must be woken to observe it.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    #[n(0)]
    pub status: DealStatus,
    #[n(1)]
    pub message: String,
    #[n(2)]
    pub deal_id: u64,
    #[n(3)]
    pub created_by: PartyId,
    #[n(4)]
    pub description: String,
    #[n(5)]
    pub token_contract: PartyId,
    #[n(6)]
    pub quantity: Quantity,
    #[n(7)]
    pub buyer: PartyId,
    #[n(8)]
    pub seller: PartyId,
    #[n(9)]
    pub arbiter: PartyId,
    #[n(10)]
    pub delivery_days: u32,
    #[n(11)]
    pub wake: Vec<PartyId>,
}

/// A transfer out of the custodian's holdings.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct PaymentRequest {
    #[n(0)]
    pub deal_id: u64,
    #[n(1)]
    pub recipient: PartyId,
    #[n(2)]
    pub asset: ExtendedAsset,
    #[n(3)]
    pub memo: String,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    #[n(0)]
    Payment(#[n(0)] PaymentRequest),
    #[n(1)]
    Notify(#[n(0)] Notification),
}

impl DealStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DealStatus::Created => "created",
            DealStatus::FullyAccepted => "accepted",
            DealStatus::Funded => "funded",
            DealStatus::Delivered => "delivered",
            DealStatus::Closed => "closed",
            DealStatus::Refunded => "refunded",
            DealStatus::Canceled => "canceled",
            DealStatus::Extended => "extended",
            DealStatus::Arbitration => "arbitration",
            DealStatus::ArbRefunded => "arbrefunded",
            DealStatus::ArbEnforced => "arbenforced",
            DealStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for DealStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Notification {
    pub fn new(status: DealStatus, message: impl Into<String>, deal: &Deal, wake: Vec<PartyId>) -> Self {
        Self {
            status,
            message: message.into(),
            deal_id: deal.id(),
            created_by: deal.created_by().clone(),
            description: deal.description().to_string(),
            token_contract: deal.price().contract.clone(),
            quantity: deal.price().quantity.clone(),
            buyer: deal.buyer().clone(),
            seller: deal.seller().clone(),
            arbiter: deal.arbiter().clone(),
            delivery_days: deal.delivery_days(),
            wake,
        }
    }
}

impl PaymentRequest {
    /// The full price of `deal` to `recipient`.
    pub fn full_price(deal: &Deal, recipient: &PartyId, memo: impl Into<String>) -> Self {
        Self {
            deal_id: deal.id(),
            recipient: recipient.clone(),
            asset: deal.price().clone(),
            memo: memo.into(),
        }
    }
}

impl Effect {
    pub fn notification(&self) -> Option<&Notification> {
        match self {
            Effect::Notify(n) => Some(n),
            Effect::Payment(_) => None,
        }
    }
    pub fn payment(&self) -> Option<&PaymentRequest> {
        match self {
            Effect::Payment(p) => Some(p),
            Effect::Notify(_) => None,
        }
    }
}
