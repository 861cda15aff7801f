//! Per-order growth dividend counters.
//!
//! Each paid order carries its own payout counter: cycle 1 pays a
//! fraction of the order's handling fee, later cycles scale the previous
//! payout, and the counter hard-stops at the configured cap. Keeping the
//! counter on the order makes the growth dividend idempotent per order
//! and lets new orders start at cycle 1 regardless of platform history.

use crate::error::Result;
use crate::money::Money;
use crate::store::{decode, encode};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderGrowthState {
    pub order_id: String,
    pub owner_id: String,
    pub handling_fee: Money,
    pub cycles_paid: u32,
    pub last_payout: Money,
}

#[derive(Clone)]
pub struct GrowthStore {
    tree: sled::Tree,
}

impl GrowthStore {
    pub fn new(tree: sled::Tree) -> Self {
        Self { tree }
    }

    /// Register an order for growth dividends. First write wins; a
    /// replayed registration is a no-op.
    pub fn register_order(&self, order_id: &str, owner_id: &str, handling_fee: Money) -> Result<()> {
        let state = OrderGrowthState {
            order_id: order_id.to_string(),
            owner_id: owner_id.to_string(),
            handling_fee,
            cycles_paid: 0,
            last_payout: Money::ZERO,
        };
        let _ = self.tree.compare_and_swap(
            order_id.as_bytes(),
            None as Option<&[u8]>,
            Some(encode(&state)?),
        )?;
        Ok(())
    }

    pub fn get(&self, order_id: &str) -> Result<Option<OrderGrowthState>> {
        match self.tree.get(order_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn all(&self) -> Result<Vec<OrderGrowthState>> {
        let mut orders = Vec::new();
        for item in self.tree.iter() {
            let (_, value) = item?;
            orders.push(decode(&value)?);
        }
        Ok(orders)
    }

    /// Record a paid cycle for an order.
    pub fn record_payout(&self, order_id: &str, payout: Money) -> Result<Option<OrderGrowthState>> {
        match self.tree.get(order_id.as_bytes())? {
            Some(bytes) => {
                let mut state: OrderGrowthState = decode(&bytes)?;
                state.cycles_paid += 1;
                state.last_payout = payout;
                self.tree.insert(order_id.as_bytes(), encode(&state)?)?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[test]
    fn test_register_is_first_write_wins() {
        let store = Store::open_temporary().unwrap();
        store
            .growth
            .register_order("ord-1", "u-1", Money::from_major(10))
            .unwrap();
        // replay with a different fee must not clobber the original
        store
            .growth
            .register_order("ord-1", "u-1", Money::from_major(99))
            .unwrap();
        let state = store.growth.get("ord-1").unwrap().unwrap();
        assert_eq!(state.handling_fee, Money::from_major(10));
        assert_eq!(state.cycles_paid, 0);
    }

    #[test]
    fn test_record_payout_advances_counter() {
        let store = Store::open_temporary().unwrap();
        store
            .growth
            .register_order("ord-1", "u-1", Money::from_major(10))
            .unwrap();
        let state = store
            .growth
            .record_payout("ord-1", Money::from_cents(250))
            .unwrap()
            .unwrap();
        assert_eq!(state.cycles_paid, 1);
        assert_eq!(state.last_payout, Money::from_cents(250));
        assert!(store
            .growth
            .record_payout("missing", Money::from_cents(1))
            .unwrap()
            .is_none());
    }
}
