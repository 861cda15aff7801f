//! Immutable execution records and distribution entries.
//!
//! An ExecutionRecord is written exactly once per successful cycle and
//! is the idempotency source of truth: insert-if-absent on the cycle
//! key, a second writer gets `AlreadyExecuted`. Distribution entries
//! are keyed by `period:kind:participant` so replaying a batch cannot
//! double-write a line item.

use crate::error::{EngineError, Result};
use crate::money::Money;
use crate::store::{decode, encode};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecuteType {
    Periodic,
    Monthly,
    Growth,
}

impl fmt::Display for ExecuteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecuteType::Periodic => write!(f, "periodic"),
            ExecuteType::Monthly => write!(f, "monthly"),
            ExecuteType::Growth => write!(f, "growth"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantKind {
    User,
    Merchant,
}

impl fmt::Display for ParticipantKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParticipantKind::User => write!(f, "user"),
            ParticipantKind::Merchant => write!(f, "merchant"),
        }
    }
}

/// What a participant's split weight was based on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightBasis {
    Integral,
    Equity,
    Count,
}

/// One row per successful payout cycle. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub pool_id: u64,
    pub cycle_sequence: u64,
    pub execute_type: ExecuteType,
    pub total_amount_at_execution: Money,
    pub actual_distributed: Money,
    pub deduct_retained: Money,
    pub threshold_before: Money,
    pub threshold_after: Money,
    pub growth_rate_applied: u32,
    pub user_count: u64,
    pub merchant_count: u64,
    pub executed_at: i64,
}

impl ExecutionRecord {
    /// Storage key for the cycle this record marks.
    pub fn cycle_key(pool_id: u64, execute_type: ExecuteType, sequence: u64) -> String {
        format!("{:020}:{}:{:010}", pool_id, execute_type, sequence)
    }

    /// Inverse of [`cycle_key`](Self::cycle_key).
    pub fn parse_cycle_key(key: &str) -> Option<(u64, ExecuteType, u64)> {
        let mut parts = key.splitn(3, ':');
        let pool_id = parts.next()?.parse().ok()?;
        let execute_type = match parts.next()? {
            "periodic" => ExecuteType::Periodic,
            "monthly" => ExecuteType::Monthly,
            "growth" => ExecuteType::Growth,
            _ => return None,
        };
        let sequence = parts.next()?.parse().ok()?;
        Some((pool_id, execute_type, sequence))
    }
}

#[derive(Clone)]
pub struct ExecutionStore {
    tree: sled::Tree,
}

impl ExecutionStore {
    pub fn new(tree: sled::Tree) -> Self {
        Self { tree }
    }

    pub fn find(
        &self,
        pool_id: u64,
        execute_type: ExecuteType,
        sequence: u64,
    ) -> Result<Option<ExecutionRecord>> {
        let key = ExecutionRecord::cycle_key(pool_id, execute_type, sequence);
        match self.tree.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Insert-if-absent. A record already present for this cycle means
    /// another invocation won the race; the caller must treat that as an
    /// idempotent no-op, not retry.
    pub fn append(&self, record: &ExecutionRecord) -> Result<()> {
        let key =
            ExecutionRecord::cycle_key(record.pool_id, record.execute_type, record.cycle_sequence);
        let bytes = encode(record)?;
        match self
            .tree
            .compare_and_swap(key.as_bytes(), None as Option<&[u8]>, Some(bytes))?
        {
            Ok(()) => Ok(()),
            Err(_) => Err(EngineError::AlreadyExecuted),
        }
    }

    /// Overwrite an existing record with corrected totals, e.g. after a
    /// parked batch replays into an already-settled cycle. Refused for a
    /// cycle that was never recorded; `append` owns the first write.
    pub fn amend(&self, record: &ExecutionRecord) -> Result<()> {
        let key =
            ExecutionRecord::cycle_key(record.pool_id, record.execute_type, record.cycle_sequence);
        if self.tree.get(key.as_bytes())?.is_none() {
            return Err(EngineError::Validation(format!(
                "no execution record to amend at {}",
                key
            )));
        }
        self.tree.insert(key.as_bytes(), encode(record)?)?;
        Ok(())
    }

    pub fn for_pool(&self, pool_id: u64) -> Result<Vec<ExecutionRecord>> {
        let prefix = format!("{:020}:", pool_id);
        let mut records = Vec::new();
        for item in self.tree.scan_prefix(prefix.as_bytes()) {
            let (_, value) = item?;
            records.push(decode(&value)?);
        }
        Ok(records)
    }

    /// Latest periodic record for a pool, if any. Drives the next
    /// cycle-sequence number and the threshold baseline.
    pub fn last_periodic(&self, pool_id: u64) -> Result<Option<ExecutionRecord>> {
        let prefix = format!("{:020}:{}:", pool_id, ExecuteType::Periodic);
        let mut last = None;
        for item in self.tree.scan_prefix(prefix.as_bytes()) {
            let (_, value) = item?;
            last = Some(decode(&value)?);
        }
        Ok(last)
    }

    pub fn all(&self) -> Result<Vec<ExecutionRecord>> {
        let mut records = Vec::new();
        for item in self.tree.iter() {
            let (_, value) = item?;
            records.push(decode(&value)?);
        }
        Ok(records)
    }
}

/// One line-item payout to one participant within a cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionEntry {
    pub id: String,
    pub period_id: String,
    pub participant_type: ParticipantKind,
    pub participant_id: String,
    pub amount: Money,
    pub weight_basis: WeightBasis,
    pub created_at: i64,
}

impl DistributionEntry {
    pub fn storage_key(period_id: &str, kind: ParticipantKind, participant_id: &str) -> String {
        format!("{}:{}:{}", period_id, kind, participant_id)
    }
}

/// Outcome of an insert-if-absent entry write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryWrite {
    Inserted,
    Duplicate,
}

#[derive(Clone)]
pub struct DistributionStore {
    tree: sled::Tree,
}

impl DistributionStore {
    pub fn new(tree: sled::Tree) -> Self {
        Self { tree }
    }

    pub fn insert(&self, entry: &DistributionEntry) -> Result<EntryWrite> {
        let key = DistributionEntry::storage_key(
            &entry.period_id,
            entry.participant_type,
            &entry.participant_id,
        );
        let bytes = encode(entry)?;
        match self
            .tree
            .compare_and_swap(key.as_bytes(), None as Option<&[u8]>, Some(bytes))?
        {
            Ok(()) => Ok(EntryWrite::Inserted),
            Err(_) => Ok(EntryWrite::Duplicate),
        }
    }

    pub fn for_period(&self, period_id: &str) -> Result<Vec<DistributionEntry>> {
        let prefix = format!("{}:", period_id);
        let mut entries = Vec::new();
        for item in self.tree.scan_prefix(prefix.as_bytes()) {
            let (_, value) = item?;
            entries.push(decode(&value)?);
        }
        Ok(entries)
    }

    pub fn total_for_period(&self, period_id: &str) -> Result<Money> {
        Ok(self.for_period(period_id)?.iter().map(|e| e.amount).sum())
    }

    pub fn count_for_period(&self, period_id: &str) -> Result<(u64, u64)> {
        let mut users = 0;
        let mut merchants = 0;
        for entry in self.for_period(period_id)? {
            match entry.participant_type {
                ParticipantKind::User => users += 1,
                ParticipantKind::Merchant => merchants += 1,
            }
        }
        Ok((users, merchants))
    }
}
