//! Delivery of queued effects to the payment gateway and notification bus
use crate::deal::PartyId;
use crate::effect::Effect;
use crate::ledger::{NotificationBus, PaymentGateway};
use crate::store::DealStore;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    /// Entry the pass stopped at, with the transport's reason.
    pub stalled: Option<(u64, String)>,
}

pub struct Outbox<'a> {
    store: &'a DealStore,
    custodian: &'a PartyId,
}

impl<'a> Outbox<'a> {
    pub fn new(store: &'a DealStore, custodian: &'a PartyId) -> Self {
        Self { store, custodian }
    }

    pub fn pending(&self) -> anyhow::Result<Vec<(u64, Effect)>> {
        self.store.outbox()
    }

    /// Delivers entries in commit order, removing each once handed over. The
    /// first failure ends the pass; it and every later entry stay queued.
    pub fn dispatch(&self, gateway: &dyn PaymentGateway, bus: &dyn NotificationBus) -> anyhow::Result<DispatchReport> {
        let mut report = DispatchReport::default();

        for (seq, effect) in self.pending()? {
            let sent = match &effect {
                Effect::Payment(payment) => gateway.transfer(
                    self.custodian,
                    &payment.recipient,
                    &payment.asset,
                    &payment.memo,
                ),
                Effect::Notify(notification) => bus.publish(notification),
            };

            if let Err(e) = sent {
                tracing::warn!(seq, error = %e, "effect delivery failed, leaving it queued");
                report.stalled = Some((seq, e.to_string()));
                break;
            }
            self.store.remove_outbox(seq)?;
            report.delivered += 1;
        }

        Ok(report)
    }
}
