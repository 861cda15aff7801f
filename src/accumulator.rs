//! Pool crediting from paid-fee events.
//!
//! The entry point of the engine's data flow. A finalized, audited,
//! paid order event credits 40% of its handling fee to the region pool;
//! anything that fails the gate is logged and dropped without error so
//! upstream replay never wedges on a bad event.

use crate::config::EngineConfig;
use crate::money::Money;
use crate::store::{PoolChangeEntry, SharedStore};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Pending,
    Approved,
    Rejected,
}

/// Order-side contract consumed by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaidFeeEvent {
    pub order_id: String,
    pub region_id: String,
    pub buyer_id: String,
    pub pay_amount: Money,
    pub handling_fee: Money,
    pub paid_at: i64,
    pub paid: bool,
    pub audit_status: AuditStatus,
}

pub struct PoolAccumulator {
    store: SharedStore,
    config: EngineConfig,
}

impl PoolAccumulator {
    pub fn new(store: SharedStore, config: EngineConfig) -> Self {
        Self { store, config }
    }

    /// Credit a paid-fee event to its region pool.
    ///
    /// Returns the credited pool id, or `Ok(None)` for events that do
    /// not qualify. Also bumps the platform paid-volume counter and
    /// registers the order for growth dividends.
    pub fn credit(&self, event: &PaidFeeEvent) -> crate::error::Result<Option<u64>> {
        if !event.paid {
            debug!("[POOL] skipping unpaid order {}", event.order_id);
            return Ok(None);
        }
        if event.audit_status != AuditStatus::Approved {
            debug!(
                "[POOL] skipping order {} with audit status {:?}",
                event.order_id, event.audit_status
            );
            return Ok(None);
        }
        if !event.handling_fee.is_positive() {
            debug!(
                "[POOL] skipping order {} with non-positive fee {}",
                event.order_id, event.handling_fee
            );
            return Ok(None);
        }

        let credit = event.handling_fee.mul_bps(self.config.fee_share_bps);
        if !credit.is_positive() {
            debug!(
                "[POOL] fee {} on order {} rounds to zero credit",
                event.handling_fee, event.order_id
            );
            return Ok(None);
        }

        let pool = self.store.pools.credit(&event.region_id, credit)?;
        self.store.pools.log_change(&PoolChangeEntry {
            pool_id: pool.id,
            region_id: event.region_id.clone(),
            order_id: event.order_id.clone(),
            change_amount: credit,
            handling_fee: event.handling_fee,
            created_at: Utc::now().timestamp(),
        })?;

        self.store.add_platform_volume(event.pay_amount.cents())?;
        self.store
            .growth
            .register_order(&event.order_id, &event.buyer_id, event.handling_fee)?;

        info!(
            "[POOL] credited {} to pool {} (region {}) from order {}",
            credit, pool.id, pool.region_id, event.order_id
        );
        crate::metrics::POOL_CREDITS_TOTAL.inc();
        Ok(Some(pool.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use std::sync::Arc;

    fn event(order: &str, fee: Money) -> PaidFeeEvent {
        PaidFeeEvent {
            order_id: order.to_string(),
            region_id: "r1".to_string(),
            buyer_id: "u-1".to_string(),
            pay_amount: Money::from_major(100),
            handling_fee: fee,
            paid_at: Utc::now().timestamp(),
            paid: true,
            audit_status: AuditStatus::Approved,
        }
    }

    fn accumulator() -> PoolAccumulator {
        PoolAccumulator::new(
            Arc::new(Store::open_temporary().unwrap()),
            EngineConfig::default(),
        )
    }

    #[test]
    fn test_credits_forty_percent_of_fee() {
        let acc = accumulator();
        let pool_id = acc.credit(&event("ord-1", Money::from_major(10))).unwrap();
        assert!(pool_id.is_some());
        let pool = acc.store.pools.get("r1").unwrap().unwrap();
        assert_eq!(pool.available_amount, Money::from_major(4));
        assert_eq!(pool.initial_threshold, Money::from_major(4));
        // order registered for growth dividends
        assert!(acc.store.growth.get("ord-1").unwrap().is_some());
        // platform volume tracks the pay amount
        assert_eq!(acc.store.platform_volume().unwrap(), 10_000);
    }

    #[test]
    fn test_rejected_events_are_noops() {
        let acc = accumulator();

        let mut unpaid = event("ord-1", Money::from_major(10));
        unpaid.paid = false;
        assert_eq!(acc.credit(&unpaid).unwrap(), None);

        let mut unaudited = event("ord-2", Money::from_major(10));
        unaudited.audit_status = AuditStatus::Pending;
        assert_eq!(acc.credit(&unaudited).unwrap(), None);

        let zero_fee = event("ord-3", Money::ZERO);
        assert_eq!(acc.credit(&zero_fee).unwrap(), None);

        assert!(acc.store.pools.get("r1").unwrap().is_none());
        assert_eq!(acc.store.platform_volume().unwrap(), 0);
    }

    #[test]
    fn test_change_log_row_per_credit() {
        let acc = accumulator();
        acc.credit(&event("ord-1", Money::from_major(10))).unwrap();
        acc.credit(&event("ord-2", Money::from_major(5))).unwrap();
        let changes = acc.store.pools.changes_for_region("r1").unwrap();
        assert_eq!(changes.len(), 2);
        let total: Money = changes.iter().map(|c| c.change_amount).sum();
        assert_eq!(total, Money::from_major(6));
    }
}
