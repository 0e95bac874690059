//! Deal state machine
//!
//! Pure decision logic. Each transition takes the current record and the acting
//! party, checks authority first and lifecycle preconditions second, and returns
//! the next record together with every effect the environment must carry out.
//! Nothing here touches storage; the service layer stages and commits the
//! returned [`Transition`].
use crate::asset::Quantity;
use crate::config::EscrowConfig;
use crate::deal::{Deal, DealFlags, DealTerms, PartyId, Role, TimeStamp};
use crate::effect::{DealStatus, Effect, Notification, PaymentRequest};
use crate::error::{AuthError, EscrowError, StateError, ValidationError};
use crate::ledger::AccountOracle;
use crate::utils;
use chrono::{TimeDelta, Utc};

pub type MachineResult<T> = Result<T, EscrowError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Created(Deal),
    Updated(Deal),
    /// The record leaves the store; this is its final snapshot.
    Removed(Deal),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub outcome: Outcome,
    pub effects: Vec<Effect>,
}

/// The asset side of an inbound transfer, as seen by the funding rule.
#[derive(Debug, Clone, Copy)]
pub struct Funding<'a> {
    pub from: &'a PartyId,
    pub contract: &'a PartyId,
    pub quantity: &'a Quantity,
}

pub struct DealMachine<'a> {
    config: &'a EscrowConfig,
}

impl Outcome {
    pub fn deal(&self) -> &Deal {
        match self {
            Outcome::Created(d) | Outcome::Updated(d) | Outcome::Removed(d) => d,
        }
    }
    pub fn is_removed(&self) -> bool {
        matches!(self, Outcome::Removed(_))
    }
}

impl Transition {
    fn new(outcome: Outcome) -> Self {
        Self {
            outcome,
            effects: vec![],
        }
    }
    fn notify(mut self, status: DealStatus, message: impl Into<String>, wake: &[&PartyId]) -> Self {
        let wake = wake.iter().map(|p| (*p).clone()).collect();
        let notification = Notification::new(status, message, self.outcome.deal(), wake);
        self.effects.push(Effect::Notify(notification));
        self
    }
    fn pay(mut self, recipient: &PartyId, memo: impl Into<String>) -> Self {
        let payment = PaymentRequest::full_price(self.outcome.deal(), recipient, memo);
        self.effects.push(Effect::Payment(payment));
        self
    }

    pub fn deal(&self) -> &Deal {
        self.outcome.deal()
    }
    pub fn notifications(&self) -> impl Iterator<Item = &Notification> {
        self.effects.iter().filter_map(Effect::notification)
    }
    pub fn payments(&self) -> impl Iterator<Item = &PaymentRequest> {
        self.effects.iter().filter_map(Effect::payment)
    }
    /// Status of the last notification, if the transition was visible at all.
    pub fn status(&self) -> Option<DealStatus> {
        self.notifications().last().map(|n| n.status)
    }
}

fn deadline(now: TimeStamp<Utc>, window: TimeDelta) -> Result<TimeStamp<Utc>, ValidationError> {
    now.checked_add(window).ok_or(ValidationError::ExpiryOutOfRange)
}

fn require_role(deal: &Deal, actor: &PartyId, role: Role) -> MachineResult<()> {
    if deal.party(role) != actor {
        return Err(AuthError::RoleRequired(role).into());
    }
    Ok(())
}

impl<'a> DealMachine<'a> {
    pub fn new(config: &'a EscrowConfig) -> Self {
        Self { config }
    }

    /// Proposes a new deal. The id comes from the digest of `tx_content`; the
    /// caller must reject it if it is already taken.
    pub fn create(
        &self,
        oracle: &dyn AccountOracle,
        creator: &PartyId,
        terms: &DealTerms,
        tx_content: &[u8],
        now: TimeStamp<Utc>,
    ) -> MachineResult<Transition> {
        let valid = terms.validate()?;

        for account in [valid.token_contract, valid.buyer, valid.seller, valid.arbiter] {
            if !oracle.is_account(account) {
                return Err(ValidationError::UnknownAccount(account.to_string()).into());
            }
        }
        // Heuristic only: the buyer should hold a row of the payment token.
        if !oracle.has_balance(valid.buyer, valid.token_contract, &valid.quantity.symbol) {
            return Err(ValidationError::NoBalance {
                contract: valid.token_contract.to_string(),
                symbol: valid.quantity.symbol.to_string(),
            }
            .into());
        }

        let id = utils::derive_deal_id(tx_content);
        let deal = Deal::propose(id, creator.clone(), valid, deadline(now, self.config.new_deal_window)?);
        let (buyer, seller) = (deal.buyer().clone(), deal.seller().clone());

        Ok(Transition::new(Outcome::Created(deal)).notify(
            DealStatus::Created,
            "New deal created",
            &[&seller, &buyer],
        ))
    }

    pub fn accept(&self, deal: &Deal, party: &PartyId, now: TimeStamp<Utc>) -> MachineResult<Transition> {
        let role = deal.role_of(party).ok_or(AuthError::NotAParty)?;
        let flag = role.accepted_flag().ok_or(AuthError::NotAParty)?;
        if deal.flags().contains(flag) {
            return Err(StateError::AlreadyAccepted(role).into());
        }

        let mut next = deal.clone();
        next.set_accepted(flag);
        if !next.is_fully_accepted() {
            return Ok(Transition::new(Outcome::Updated(next)));
        }

        next.advance_expiry(deadline(now, self.config.accepted_window)?)?;
        let (buyer, seller) = (next.buyer().clone(), next.seller().clone());
        Ok(Transition::new(Outcome::Updated(next)).notify(
            DealStatus::FullyAccepted,
            "Deal is fully accepted",
            &[&seller, &buyer],
        ))
    }

    pub fn fund(&self, deal: &Deal, funding: Funding<'_>, now: TimeStamp<Utc>) -> MachineResult<Transition> {
        if deal.flags().contains(DealFlags::FUNDED) {
            return Err(StateError::AlreadyFunded.into());
        }
        if !deal.is_fully_accepted() {
            return Err(StateError::NotAccepted.into());
        }
        if funding.from != deal.buyer() {
            return Err(AuthError::NotBuyer.into());
        }
        let price = deal.price();
        if funding.contract != &price.contract || funding.quantity != &price.quantity {
            return Err(ValidationError::PriceMismatch {
                expected: price.to_string(),
                got: format!("{} via {}", funding.quantity, funding.contract),
            }
            .into());
        }

        let mut next = deal.clone();
        next.mark_funded(now)?;
        let seller = next.seller().clone();
        Ok(Transition::new(Outcome::Updated(next)).notify(
            DealStatus::Funded,
            "Deal is funded",
            &[&seller],
        ))
    }

    pub fn deliver(&self, deal: &Deal, actor: &PartyId, now: TimeStamp<Utc>) -> MachineResult<Transition> {
        require_role(deal, actor, Role::Seller)?;
        if !deal.is_funded() {
            return Err(StateError::NotFunded.into());
        }
        if deal.is_delivered() {
            return Err(StateError::AlreadyDelivered.into());
        }

        let mut next = deal.clone();
        next.mark_delivered(deadline(now, self.config.delivered_window)?)?;
        let buyer = next.buyer().clone();
        Ok(Transition::new(Outcome::Updated(next)).notify(
            DealStatus::Delivered,
            "Deal is marked as delivered",
            &[&buyer],
        ))
    }

    /// Buyer confirms receipt and the seller is paid. Delivery need not have
    /// been marked first.
    pub fn goods_received(&self, deal: &Deal, actor: &PartyId) -> MachineResult<Transition> {
        require_role(deal, actor, Role::Buyer)?;
        if !deal.is_funded() {
            return Err(StateError::NotFunded.into());
        }
        if deal.in_arbitration() {
            return Err(StateError::InArbitration.into());
        }

        let seller = deal.seller().clone();
        let memo = format!("Deal {}: goods received", deal.id());
        Ok(Transition::new(Outcome::Removed(deal.clone()))
            .pay(&seller, memo)
            .notify(DealStatus::Closed, "Deal is closed", &[&seller]))
    }

    pub fn cancel(&self, deal: &Deal, actor: &PartyId) -> MachineResult<Transition> {
        let role = match deal.role_of(actor) {
            Some(role @ (Role::Buyer | Role::Seller)) => role,
            _ => return Err(AuthError::NotAParty.into()),
        };
        let (buyer, seller) = (deal.buyer().clone(), deal.seller().clone());

        if !deal.is_funded() {
            return Ok(Transition::new(Outcome::Removed(deal.clone())).notify(
                DealStatus::Canceled,
                "Deal is canceled",
                &[&seller, &buyer],
            ));
        }
        if deal.in_arbitration() {
            return Err(StateError::InArbitration.into());
        }
        if role != Role::Seller {
            return Err(AuthError::FundedCancel.into());
        }

        let memo = format!("Deal {} canceled by seller", deal.id());
        Ok(Transition::new(Outcome::Removed(deal.clone()))
            .pay(&buyer, memo)
            .notify(DealStatus::Refunded, "Buyer is refunded", &[&buyer])
            .notify(DealStatus::Canceled, "Deal is canceled", &[&buyer]))
    }

    /// Buyer grants the seller more time. There is no cap on the total term.
    pub fn extend(&self, deal: &Deal, actor: &PartyId, more_days: u32) -> MachineResult<Transition> {
        require_role(deal, actor, Role::Buyer)?;
        if more_days == 0 {
            return Err(ValidationError::ZeroExtension.into());
        }
        if !deal.is_funded() {
            return Err(StateError::NotFunded.into());
        }
        if deal.in_arbitration() {
            return Err(StateError::InArbitration.into());
        }

        let mut next = deal.clone();
        next.extend_term(more_days)?;
        let seller = next.seller().clone();
        let message = format!("Delivery term extended by {more_days} days");
        Ok(Transition::new(Outcome::Updated(next)).notify(DealStatus::Extended, message, &[&seller]))
    }

    /// Arbiter's decision on a disputed deal: refund the buyer, or enforce
    /// payment to the seller. The party not paid is woken.
    pub fn arbitrate(&self, deal: &Deal, actor: &PartyId, refund: bool) -> MachineResult<Transition> {
        require_role(deal, actor, Role::Arbiter)?;
        if !deal.in_arbitration() {
            return Err(StateError::NotInArbitration.into());
        }

        let (buyer, seller) = (deal.buyer().clone(), deal.seller().clone());
        let (paid, other, status, message) = if refund {
            (buyer, seller, DealStatus::ArbRefunded, "Arbiter refunded the buyer")
        } else {
            (seller, buyer, DealStatus::ArbEnforced, "Arbiter enforced payment to the seller")
        };
        let memo = format!("Deal {}: {}", deal.id(), message);
        Ok(Transition::new(Outcome::Removed(deal.clone()))
            .pay(&paid, memo)
            .notify(status, message, &[&other]))
    }

    /// Resolution of a deal whose expiry has passed. Delivered deals are locked
    /// for arbitration; anything else is reclaimed, refunding a funded buyer.
    pub fn expire(&self, deal: &Deal) -> Transition {
        let (buyer, seller, arbiter) = (
            deal.buyer().clone(),
            deal.seller().clone(),
            deal.arbiter().clone(),
        );

        if deal.is_delivered() {
            let mut next = deal.clone();
            next.lock_for_arbitration();
            return Transition::new(Outcome::Updated(next)).notify(
                DealStatus::Arbitration,
                "Missing goods received. The deal is open for arbitration",
                &[&seller, &buyer, &arbiter],
            );
        }

        let message = format!("Deal {} expired", deal.id());
        let transition = Transition::new(Outcome::Removed(deal.clone()));
        if deal.is_funded() {
            // the refund itself reaches the buyer
            transition
                .pay(&buyer, message.clone())
                .notify(DealStatus::Expired, message, &[&seller])
        } else {
            transition.notify(DealStatus::Expired, message, &[&seller, &buyer])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::Symbol;
    use crate::deal::{DealState, Expiry, SECONDS_PER_DAY};
    use crate::ledger::InMemoryLedger;

    const T0: i64 = 1_700_000_000;

    fn config() -> EscrowConfig {
        EscrowConfig::new("escrow".into())
    }

    fn ledger() -> InMemoryLedger {
        let ledger = InMemoryLedger::new();
        for account in ["eosio.token", "alice", "bob", "carol", "dave"] {
            ledger.add_account(account.into());
        }
        ledger.add_balance_row("alice".into(), "eosio.token".into(), Symbol::new("EOS", 4));
        ledger
    }

    fn price() -> Quantity {
        Quantity::new(1_000_000, Symbol::new("EOS", 4))
    }

    fn terms() -> DealTerms {
        DealTerms::new()
            .set_description("a bicycle")
            .set_token_contract("eosio.token".into())
            .set_quantity(price())
            .set_buyer("alice".into())
            .set_seller("bob".into())
            .set_arbiter("carol".into())
            .set_delivery_days(5)
    }

    fn proposed(config: &EscrowConfig) -> Deal {
        let machine = DealMachine::new(config);
        let t = machine
            .create(&ledger(), &"alice".into(), &terms(), b"tx-1", TimeStamp::from_unix(T0))
            .unwrap();
        t.deal().clone()
    }

    fn funded(config: &EscrowConfig) -> Deal {
        let machine = DealMachine::new(config);
        let deal = proposed(config);
        let deal = machine
            .accept(&deal, &"bob".into(), TimeStamp::from_unix(T0 + 10))
            .unwrap()
            .deal()
            .clone();
        let funding = Funding {
            from: &"alice".into(),
            contract: &"eosio.token".into(),
            quantity: &price(),
        };
        machine
            .fund(&deal, funding, TimeStamp::from_unix(T0 + 20))
            .unwrap()
            .deal()
            .clone()
    }

    #[test]
    fn create_checks_accounts_and_balance() {
        let config = config();
        let machine = DealMachine::new(&config);
        let now = TimeStamp::from_unix(T0);

        let err = machine
            .create(&ledger(), &"alice".into(), &terms().set_arbiter("zed".into()), b"tx", now)
            .unwrap_err();
        assert_eq!(err, ValidationError::UnknownAccount("zed".into()).into());

        let poor = terms().set_buyer("dave".into());
        let err = machine.create(&ledger(), &"dave".into(), &poor, b"tx", now).unwrap_err();
        assert!(matches!(err, EscrowError::Validation(ValidationError::NoBalance { .. })));
    }

    #[test]
    fn create_wakes_both_trading_parties() {
        let config = config();
        let machine = DealMachine::new(&config);
        let t = machine
            .create(&ledger(), &"carol".into(), &terms(), b"tx-1", TimeStamp::from_unix(T0))
            .unwrap();

        assert!(matches!(t.outcome, Outcome::Created(_)));
        assert_eq!(t.deal().id(), utils::derive_deal_id(b"tx-1"));
        assert_eq!(t.deal().state(), DealState::Proposed);
        assert_eq!(
            t.deal().expires(),
            Expiry::At(TimeStamp::from_unix(T0 + 3 * SECONDS_PER_DAY))
        );
        let n = t.notifications().next().unwrap();
        assert_eq!(n.status, DealStatus::Created);
        assert_eq!(n.wake, vec![PartyId::from("bob"), PartyId::from("alice")]);
    }

    #[test]
    fn partial_acceptance_is_silent() {
        let config = config();
        let machine = DealMachine::new(&config);
        let t = machine
            .create(&ledger(), &"carol".into(), &terms(), b"tx-1", TimeStamp::from_unix(T0))
            .unwrap();
        let before = t.deal().clone();

        let t = machine.accept(&before, &"alice".into(), TimeStamp::from_unix(T0 + 5)).unwrap();
        assert!(t.effects.is_empty());
        assert_eq!(t.deal().expires(), before.expires());
        assert!(t.deal().flags().contains(DealFlags::BUYER_ACCEPTED));
    }

    #[test]
    fn full_acceptance_refreshes_expiry() {
        let config = config();
        let machine = DealMachine::new(&config);
        let deal = proposed(&config);

        let t = machine.accept(&deal, &"bob".into(), TimeStamp::from_unix(T0 + 60)).unwrap();
        assert_eq!(t.status(), Some(DealStatus::FullyAccepted));
        assert_eq!(t.deal().state(), DealState::BothAccepted);
        assert_eq!(
            t.deal().expires(),
            Expiry::At(TimeStamp::from_unix(T0 + 60 + 3 * SECONDS_PER_DAY))
        );

        let err = machine.accept(t.deal(), &"alice".into(), TimeStamp::from_unix(T0 + 61));
        assert_eq!(err.unwrap_err(), StateError::AlreadyAccepted(Role::Buyer).into());
        let err = machine.accept(t.deal(), &"carol".into(), TimeStamp::from_unix(T0 + 61));
        assert_eq!(err.unwrap_err(), AuthError::NotAParty.into());
    }

    #[test]
    fn funding_requires_exact_price_from_buyer() {
        let config = config();
        let machine = DealMachine::new(&config);
        let deal = proposed(&config);
        let now = TimeStamp::from_unix(T0 + 30);
        let funding = Funding {
            from: &"alice".into(),
            contract: &"eosio.token".into(),
            quantity: &price(),
        };

        assert_eq!(
            machine.fund(&deal, funding, now).unwrap_err(),
            StateError::NotAccepted.into()
        );

        let deal = machine.accept(&deal, &"bob".into(), now).unwrap().deal().clone();
        let wrong_sender = Funding { from: &"bob".into(), ..funding };
        assert_eq!(
            machine.fund(&deal, wrong_sender, now).unwrap_err(),
            AuthError::NotBuyer.into()
        );
        let short = Quantity::new(999_999, Symbol::new("EOS", 4));
        let short = Funding { quantity: &short, ..funding };
        assert!(machine.fund(&deal, short, now).unwrap_err().is_validation());
        let fake = Funding { contract: &"fake.token".into(), ..funding };
        assert!(machine.fund(&deal, fake, now).unwrap_err().is_validation());

        let t = machine.fund(&deal, funding, now).unwrap();
        assert_eq!(t.deal().funded_at(), Some(now));
        assert_eq!(t.deal().expires(), Expiry::At(now.plus_days(5)));
        assert_eq!(t.notifications().next().unwrap().wake, vec![PartyId::from("bob")]);
        assert_eq!(
            machine.fund(t.deal(), funding, now).unwrap_err(),
            StateError::AlreadyFunded.into()
        );
    }

    #[test]
    fn only_the_seller_delivers_a_funded_deal() {
        let config = config();
        let machine = DealMachine::new(&config);
        let now = TimeStamp::from_unix(T0 + 100);

        let unfunded = proposed(&config);
        assert_eq!(
            machine.deliver(&unfunded, &"bob".into(), now).unwrap_err(),
            StateError::NotFunded.into()
        );

        let deal = funded(&config);
        assert_eq!(
            machine.deliver(&deal, &"alice".into(), now).unwrap_err(),
            AuthError::RoleRequired(Role::Seller).into()
        );
        let t = machine.deliver(&deal, &"bob".into(), now).unwrap();
        assert_eq!(t.deal().state(), DealState::Delivered);
        assert_eq!(
            machine.deliver(t.deal(), &"bob".into(), now).unwrap_err(),
            StateError::AlreadyDelivered.into()
        );
    }

    #[test]
    fn goods_received_pays_seller_without_delivery_mark() {
        let config = config();
        let machine = DealMachine::new(&config);
        let deal = funded(&config);

        assert!(machine.goods_received(&deal, &"bob".into()).unwrap_err().is_unauthorized());
        let t = machine.goods_received(&deal, &"alice".into()).unwrap();
        assert!(t.outcome.is_removed());
        let payment = t.payments().next().unwrap();
        assert_eq!(payment.recipient, PartyId::from("bob"));
        assert_eq!(payment.asset, *deal.price());
        assert_eq!(t.status(), Some(DealStatus::Closed));
    }

    #[test]
    fn cancel_rules_depend_on_funding() {
        let config = config();
        let machine = DealMachine::new(&config);

        let unfunded = proposed(&config);
        let t = machine.cancel(&unfunded, &"alice".into()).unwrap();
        assert!(t.outcome.is_removed());
        assert_eq!(t.payments().count(), 0);
        assert!(machine.cancel(&unfunded, &"carol".into()).unwrap_err().is_unauthorized());

        let deal = funded(&config);
        assert_eq!(
            machine.cancel(&deal, &"alice".into()).unwrap_err(),
            AuthError::FundedCancel.into()
        );
        let t = machine.cancel(&deal, &"bob".into()).unwrap();
        assert_eq!(t.payments().next().unwrap().recipient, PartyId::from("alice"));
        let statuses: Vec<_> = t.notifications().map(|n| n.status).collect();
        assert_eq!(statuses, vec![DealStatus::Refunded, DealStatus::Canceled]);
    }

    #[test]
    fn extend_recomputes_from_funding_time() {
        let config = config();
        let machine = DealMachine::new(&config);
        let deal = funded(&config);

        assert_eq!(
            machine.extend(&deal, &"alice".into(), 0).unwrap_err(),
            ValidationError::ZeroExtension.into()
        );
        let t = machine.extend(&deal, &"alice".into(), 10).unwrap();
        assert_eq!(t.deal().delivery_days(), 15);
        let funded_at = deal.funded_at().unwrap();
        assert_eq!(t.deal().expires(), Expiry::At(funded_at.plus_days(15)));
    }

    #[test]
    fn expiry_locks_delivered_deals_for_arbitration() {
        let config = config();
        let machine = DealMachine::new(&config);
        let deal = funded(&config);
        let deal = machine
            .deliver(&deal, &"bob".into(), TimeStamp::from_unix(T0 + 100))
            .unwrap()
            .deal()
            .clone();

        let t = machine.expire(&deal);
        assert_eq!(t.deal().state(), DealState::Arbitration);
        assert!(t.deal().expires().is_locked());
        assert_eq!(t.payments().count(), 0);
        assert_eq!(t.notifications().next().unwrap().wake.len(), 3);

        let locked = t.deal().clone();
        assert!(machine.cancel(&locked, &"bob".into()).unwrap_err().is_state());
        assert!(machine.arbitrate(&locked, &"bob".into(), false).unwrap_err().is_unauthorized());
        let t = machine.arbitrate(&locked, &"carol".into(), false).unwrap();
        assert_eq!(t.payments().next().unwrap().recipient, PartyId::from("bob"));
        assert_eq!(t.notifications().next().unwrap().wake, vec![PartyId::from("alice")]);
    }

    #[test]
    fn expiry_refunds_funded_undelivered_deals() {
        let config = config();
        let machine = DealMachine::new(&config);

        let t = machine.expire(&funded(&config));
        assert!(t.outcome.is_removed());
        assert_eq!(t.payments().next().unwrap().recipient, PartyId::from("alice"));

        let t = machine.expire(&proposed(&config));
        assert!(t.outcome.is_removed());
        assert_eq!(t.payments().count(), 0);
        assert_eq!(t.status(), Some(DealStatus::Expired));
    }

    #[test]
    fn arbitration_requires_locked_deal() {
        let config = config();
        let machine = DealMachine::new(&config);
        let deal = funded(&config);
        assert_eq!(
            machine.arbitrate(&deal, &"carol".into(), true).unwrap_err(),
            StateError::NotInArbitration.into()
        );
    }

    #[test]
    fn deadlines_past_the_encodable_range_are_rejected() {
        let config = config();
        let machine = DealMachine::new(&config);

        let err = machine
            .create(&ledger(), &"alice".into(), &terms(), b"tx-late", TimeStamp::latest())
            .unwrap_err();
        assert_eq!(err, ValidationError::ExpiryOutOfRange.into());

        let deal = funded(&config);
        let err = machine.extend(&deal, &"alice".into(), u32::MAX - 5).unwrap_err();
        assert_eq!(err, ValidationError::TermOverflow.into());

        let late = TimeStamp::latest() + TimeDelta::days(-1);
        let err = machine.deliver(&deal, &"bob".into(), late).unwrap_err();
        assert_eq!(err, ValidationError::ExpiryOutOfRange.into());
    }
}
