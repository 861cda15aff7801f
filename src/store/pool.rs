//! Region pool state and its audit change log.
//!
//! Pools are keyed by region id. Every mutation goes through a sled
//! transaction on the pool tree so concurrent credits to the same pool
//! serialize instead of losing updates. The change log is append-only,
//! one row per credit.

use crate::error::{EngineError, Result};
use crate::money::Money;
use crate::store::{decode, encode};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sled::transaction::ConflictableTransactionError;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pool {
    pub id: u64,
    pub region_id: String,
    pub total_accumulated: Money,
    pub available_amount: Money,
    pub distributed_amount: Money,
    pub initial_threshold: Money,
    pub last_threshold_amount: Money,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Pool {
    /// `available = total − distributed`, both sides non-negative.
    pub fn invariant_holds(&self) -> bool {
        !self.available_amount.is_negative()
            && !self.distributed_amount.is_negative()
            && self.total_accumulated
                == self.available_amount.saturating_add(self.distributed_amount)
    }
}

/// Append-only audit row for one pool credit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolChangeEntry {
    pub pool_id: u64,
    pub region_id: String,
    pub order_id: String,
    pub change_amount: Money,
    pub handling_fee: Money,
    pub created_at: i64,
}

#[derive(Clone)]
pub struct PoolStore {
    pools: sled::Tree,
    change_log: sled::Tree,
    db: sled::Db,
}

impl PoolStore {
    pub fn new(pools: sled::Tree, change_log: sled::Tree, db: sled::Db) -> Self {
        Self {
            pools,
            change_log,
            db,
        }
    }

    pub fn get(&self, region_id: &str) -> Result<Option<Pool>> {
        match self.pools.get(region_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn get_by_id(&self, pool_id: u64) -> Result<Option<Pool>> {
        for item in self.pools.iter() {
            let (_, value) = item?;
            let pool: Pool = decode(&value)?;
            if pool.id == pool_id {
                return Ok(Some(pool));
            }
        }
        Ok(None)
    }

    pub fn all(&self) -> Result<Vec<Pool>> {
        let mut pools = Vec::new();
        for item in self.pools.iter() {
            let (_, value) = item?;
            pools.push(decode(&value)?);
        }
        Ok(pools)
    }

    /// Credit a pool, creating it on first use.
    ///
    /// The first credited amount seeds `initial_threshold`. Runs as a
    /// transaction on the pool tree: two concurrent credits both land.
    pub fn credit(&self, region_id: &str, amount: Money) -> Result<Pool> {
        if !amount.is_positive() {
            return Err(EngineError::Validation(format!(
                "credit amount must be positive, got {}",
                amount
            )));
        }
        let now = Utc::now().timestamp();
        let new_id = self.db.generate_id()?;
        let pool = self.pools.transaction(move |t| {
            let pool = match t.get(region_id.as_bytes())? {
                Some(bytes) => {
                    let mut pool: Pool =
                        decode(&bytes).map_err(ConflictableTransactionError::Abort)?;
                    pool.total_accumulated = pool.total_accumulated.saturating_add(amount);
                    pool.available_amount = pool.available_amount.saturating_add(amount);
                    pool.updated_at = now;
                    pool
                }
                None => Pool {
                    id: new_id,
                    region_id: region_id.to_string(),
                    total_accumulated: amount,
                    available_amount: amount,
                    distributed_amount: Money::ZERO,
                    initial_threshold: amount,
                    last_threshold_amount: Money::ZERO,
                    created_at: now,
                    updated_at: now,
                },
            };
            let bytes = encode(&pool).map_err(ConflictableTransactionError::Abort)?;
            t.insert(region_id.as_bytes(), bytes)?;
            Ok::<_, ConflictableTransactionError<EngineError>>(pool)
        })?;
        Ok(pool)
    }

    /// Apply a successful distribution to the pool.
    ///
    /// Moves `actual` from available to distributed and records the new
    /// threshold watermark. Rejected if the pool cannot cover `actual`,
    /// which keeps `distributed_amount` monotonic and the invariant
    /// intact.
    pub fn apply_distribution(
        &self,
        region_id: &str,
        actual: Money,
        new_last_threshold: Money,
    ) -> Result<Pool> {
        let now = Utc::now().timestamp();
        let pool = self.pools.transaction(move |t| {
            let bytes = t.get(region_id.as_bytes())?.ok_or_else(|| {
                ConflictableTransactionError::Abort(EngineError::Validation(format!(
                    "pool for region {} does not exist",
                    region_id
                )))
            })?;
            let mut pool: Pool = decode(&bytes).map_err(ConflictableTransactionError::Abort)?;
            if pool.available_amount < actual {
                return Err(ConflictableTransactionError::Abort(
                    EngineError::Persistence(format!(
                        "pool {} cannot cover distribution of {} (available {})",
                        pool.id, actual, pool.available_amount
                    )),
                ));
            }
            pool.available_amount = pool.available_amount.saturating_sub(actual);
            pool.distributed_amount = pool.distributed_amount.saturating_add(actual);
            pool.last_threshold_amount = new_last_threshold;
            pool.updated_at = now;
            let bytes = encode(&pool).map_err(ConflictableTransactionError::Abort)?;
            t.insert(region_id.as_bytes(), bytes)?;
            Ok::<_, ConflictableTransactionError<EngineError>>(pool)
        })?;
        info!(
            "[POOL] distribution applied pool_id={} region={} actual={} available={} threshold={}",
            pool.id, pool.region_id, actual, pool.available_amount, pool.last_threshold_amount
        );
        Ok(pool)
    }

    /// Append a change-log row for a credit.
    pub fn log_change(&self, entry: &PoolChangeEntry) -> Result<()> {
        let seq = self.db.generate_id()?;
        let key = format!("{}:{:020}", entry.region_id, seq);
        self.change_log.insert(key.as_bytes(), encode(entry)?)?;
        Ok(())
    }

    pub fn changes_for_region(&self, region_id: &str) -> Result<Vec<PoolChangeEntry>> {
        let prefix = format!("{}:", region_id);
        let mut entries = Vec::new();
        for item in self.change_log.scan_prefix(prefix.as_bytes()) {
            let (_, value) = item?;
            entries.push(decode(&value)?);
        }
        Ok(entries)
    }
}
