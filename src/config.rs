//! Tunables for deal windows and sweeping
use crate::deal::PartyId;
use chrono::TimeDelta;

pub const DEFAULT_WINDOW_DAYS: i64 = 3;
/// Expired deals reclaimed by each deferred sweep link.
pub const DEFAULT_SWEEP_BATCH: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscrowConfig {
    /// This system's own account, holder of escrowed funds.
    pub custodian: PartyId,
    pub new_deal_window: TimeDelta,
    pub accepted_window: TimeDelta,
    pub delivered_window: TimeDelta,
    pub sweep_batch: u32,
    /// Batch for sweeps any party may request directly.
    pub manual_sweep_batch: u32,
    /// Delay before a deferred sweep may run. Must be positive so a continuation
    /// never fires at its trigger's own instant.
    pub sweep_delay: TimeDelta,
}

impl EscrowConfig {
    pub fn new(custodian: PartyId) -> Self {
        Self {
            custodian,
            new_deal_window: TimeDelta::days(DEFAULT_WINDOW_DAYS),
            accepted_window: TimeDelta::days(DEFAULT_WINDOW_DAYS),
            delivered_window: TimeDelta::days(DEFAULT_WINDOW_DAYS),
            sweep_batch: DEFAULT_SWEEP_BATCH,
            manual_sweep_batch: DEFAULT_SWEEP_BATCH * 3,
            sweep_delay: TimeDelta::seconds(1),
        }
    }
    pub fn set_new_deal_window(mut self, window: TimeDelta) -> Self {
        self.new_deal_window = window;
        self
    }
    pub fn set_accepted_window(mut self, window: TimeDelta) -> Self {
        self.accepted_window = window;
        self
    }
    pub fn set_delivered_window(mut self, window: TimeDelta) -> Self {
        self.delivered_window = window;
        self
    }
    pub fn set_sweep_batch(mut self, batch: u32) -> Self {
        self.sweep_batch = batch.max(1);
        self
    }
    pub fn set_manual_sweep_batch(mut self, batch: u32) -> Self {
        self.manual_sweep_batch = batch.max(1);
        self
    }
    pub fn set_sweep_delay(mut self, delay: TimeDelta) -> Self {
        self.sweep_delay = delay.max(TimeDelta::seconds(1));
        self
    }
}
