//! Persistent state.
//!
//! One sled `Db` holds every table as a named tree, with bincode-encoded
//! records. Append-only trees (execution records, distribution entries,
//! change log, failed jobs) are only ever inserted into; pool state is
//! mutated through single-tree transactions so concurrent credits never
//! lose updates.

pub mod failed_jobs;
pub mod growth;
pub mod pool;
pub mod records;

use crate::error::{EngineError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

pub use failed_jobs::{FailedJob, FailedJobStore};
pub use growth::{GrowthStore, OrderGrowthState};
pub use pool::{Pool, PoolChangeEntry, PoolStore};
pub use records::{
    DistributionEntry, DistributionStore, EntryWrite, ExecuteType, ExecutionRecord,
    ExecutionStore, ParticipantKind, WeightBasis,
};

const TREE_POOLS: &str = "pools";
const TREE_POOL_CHANGE_LOG: &str = "pool_change_log";
const TREE_EXECUTION_RECORDS: &str = "execution_records";
const TREE_DISTRIBUTION_ENTRIES: &str = "distribution_entries";
const TREE_FAILED_JOBS: &str = "failed_jobs";
const TREE_ORDER_GROWTH: &str = "order_growth";
const TREE_META: &str = "meta";

/// Handle bundle for the engine's trees.
#[derive(Clone)]
pub struct Store {
    db: sled::Db,
    pub pools: PoolStore,
    pub executions: ExecutionStore,
    pub distributions: DistributionStore,
    pub failed_jobs: FailedJobStore,
    pub growth: GrowthStore,
    meta: sled::Tree,
}

impl Store {
    pub fn open(db: sled::Db) -> Result<Self> {
        let pools = PoolStore::new(
            db.open_tree(TREE_POOLS)?,
            db.open_tree(TREE_POOL_CHANGE_LOG)?,
            db.clone(),
        );
        let executions = ExecutionStore::new(db.open_tree(TREE_EXECUTION_RECORDS)?);
        let distributions = DistributionStore::new(db.open_tree(TREE_DISTRIBUTION_ENTRIES)?);
        let failed_jobs = FailedJobStore::new(db.open_tree(TREE_FAILED_JOBS)?, db.clone());
        let growth = GrowthStore::new(db.open_tree(TREE_ORDER_GROWTH)?);
        let meta = db.open_tree(TREE_META)?;
        Ok(Self {
            db,
            pools,
            executions,
            distributions,
            failed_jobs,
            growth,
            meta,
        })
    }

    /// Open a throwaway store backed by a temporary database.
    pub fn open_temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::open(db)
    }

    pub fn db(&self) -> &sled::Db {
        &self.db
    }

    /// Platform-wide paid volume counter consumed by the growth dividend.
    pub fn platform_volume(&self) -> Result<i64> {
        Ok(self
            .meta
            .get(b"platform_volume")?
            .map(|v| decode_i64(&v))
            .unwrap_or(0))
    }

    pub fn add_platform_volume(&self, cents: i64) -> Result<i64> {
        let updated = self.meta.transaction(|t| {
            let current = t
                .get(b"platform_volume")?
                .map(|v| decode_i64(&v))
                .unwrap_or(0);
            let next = current.saturating_add(cents);
            t.insert(b"platform_volume", &next.to_be_bytes())?;
            Ok::<_, sled::transaction::ConflictableTransactionError<EngineError>>(next)
        })?;
        Ok(updated)
    }

    /// Growth dividend threshold bookkeeping (global, not per pool).
    pub fn growth_last_threshold(&self) -> Result<Option<i64>> {
        Ok(self.meta.get(b"growth_last_threshold")?.map(|v| decode_i64(&v)))
    }

    pub fn set_growth_last_threshold(&self, cents: i64) -> Result<()> {
        self.meta
            .insert(b"growth_last_threshold", &cents.to_be_bytes())?;
        Ok(())
    }

    pub fn growth_cycle_sequence(&self) -> Result<u64> {
        Ok(self
            .meta
            .get(b"growth_cycle_sequence")?
            .map(|v| decode_i64(&v) as u64)
            .unwrap_or(0))
    }

    pub fn bump_growth_cycle_sequence(&self) -> Result<u64> {
        let next = self.meta.transaction(|t| {
            let current = t
                .get(b"growth_cycle_sequence")?
                .map(|v| decode_i64(&v))
                .unwrap_or(0);
            let next = current + 1;
            t.insert(b"growth_cycle_sequence", &next.to_be_bytes())?;
            Ok::<_, sled::transaction::ConflictableTransactionError<EngineError>>(next)
        })?;
        Ok(next as u64)
    }

    /// Month key (`YYYYMM`) of the last monthly seed run, used by the
    /// scheduler to fire once per month.
    pub fn last_monthly_key(&self) -> Result<Option<u64>> {
        Ok(self
            .meta
            .get(b"last_monthly_key")?
            .map(|v| decode_i64(&v) as u64))
    }

    pub fn set_last_monthly_key(&self, key: u64) -> Result<()> {
        self.meta
            .insert(b"last_monthly_key", &(key as i64).to_be_bytes())?;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

pub(crate) fn decode_i64(bytes: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    let take = bytes.len().min(8);
    buf[..take].copy_from_slice(&bytes[..take]);
    i64::from_be_bytes(buf)
}

/// Shared store handle used across async tasks.
pub type SharedStore = Arc<Store>;
