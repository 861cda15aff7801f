//! Payout application.
//!
//! Takes a planned entry list and turns it into ledger credits plus
//! immutable distribution entries. Every entry commits on its own: an
//! inactive participant or a duplicate replay is a skip, a storage
//! failure is recorded in the batch outcome, and neither touches the
//! entries around it.

use crate::directory::ParticipantDirectory;
use crate::error::Result;
use crate::ledger::{CreditOutcome, Ledger};
use crate::money::Money;
use crate::store::{DistributionEntry, EntryWrite, ParticipantKind, SharedStore, WeightBasis};
use chrono::Utc;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// One computed payout waiting to be applied.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PlannedEntry {
    pub participant_id: String,
    pub kind: ParticipantKind,
    pub amount: Money,
    pub weight_basis: WeightBasis,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BatchOutcome {
    pub success: u64,
    pub skipped: u64,
    pub failures: Vec<EntryFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EntryFailure {
    pub participant_id: String,
    pub message: String,
}

impl BatchOutcome {
    pub fn merge(&mut self, other: BatchOutcome) {
        self.success += other.success;
        self.skipped += other.skipped;
        self.failures.extend(other.failures);
    }

    pub fn attempted(&self) -> u64 {
        self.success + self.skipped + self.failures.len() as u64
    }
}

pub struct BonusDistributor {
    store: SharedStore,
    directory: Arc<dyn ParticipantDirectory>,
    ledger: Arc<dyn Ledger>,
}

impl BonusDistributor {
    pub fn new(
        store: SharedStore,
        directory: Arc<dyn ParticipantDirectory>,
        ledger: Arc<dyn Ledger>,
    ) -> Self {
        Self {
            store,
            directory,
            ledger,
        }
    }

    /// Apply a slice of planned entries for one period.
    ///
    /// The ledger credit is keyed by `period:kind:participant`, so a
    /// replayed batch detects every already-paid entry as a duplicate
    /// and skips it.
    pub fn apply(&self, entries: &[PlannedEntry], period_id: &str, category: &str) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for planned in entries {
            match self.apply_one(planned, period_id, category) {
                Ok(EntryOutcome::Applied) => {
                    outcome.success += 1;
                    crate::metrics::ENTRIES_APPLIED_TOTAL.inc();
                }
                Ok(EntryOutcome::Skipped) => {
                    outcome.skipped += 1;
                    crate::metrics::ENTRIES_SKIPPED_TOTAL.inc();
                }
                Err(err) => {
                    warn!(
                        "[DISTRIBUTE] entry for {} {} in {} failed: {}",
                        planned.kind, planned.participant_id, period_id, err
                    );
                    crate::metrics::ENTRIES_FAILED_TOTAL.inc();
                    outcome.failures.push(EntryFailure {
                        participant_id: planned.participant_id.clone(),
                        message: err.to_string(),
                    });
                }
            }
        }
        outcome
    }

    fn apply_one(
        &self,
        planned: &PlannedEntry,
        period_id: &str,
        category: &str,
    ) -> Result<EntryOutcome> {
        match self.directory.find(planned.kind, &planned.participant_id)? {
            Some(participant) if participant.active => {}
            _ => {
                warn!(
                    "[DISTRIBUTE] {} {} inactive or missing, skipping {} in {}",
                    planned.kind, planned.participant_id, planned.amount, period_id
                );
                return Ok(EntryOutcome::Skipped);
            }
        }

        let reference = DistributionEntry::storage_key(period_id, planned.kind, &planned.participant_id);
        let credit = self.ledger.credit_balance(
            planned.kind,
            &planned.participant_id,
            planned.amount,
            &reference,
            category,
        )?;
        if credit == CreditOutcome::Duplicate {
            return Ok(EntryOutcome::Skipped);
        }

        let write = self.store.distributions.insert(&DistributionEntry {
            id: Uuid::new_v4().to_string(),
            period_id: period_id.to_string(),
            participant_type: planned.kind,
            participant_id: planned.participant_id.clone(),
            amount: planned.amount,
            weight_basis: planned.weight_basis,
            created_at: Utc::now().timestamp(),
        })?;
        if write == EntryWrite::Duplicate {
            // ledger credit landed previously without its entry row;
            // treat as replay either way
            return Ok(EntryOutcome::Skipped);
        }
        Ok(EntryOutcome::Applied)
    }
}

enum EntryOutcome {
    Applied,
    Skipped,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{Participant, SledDirectory};
    use crate::ledger::SledLedger;
    use crate::store::Store;

    fn harness() -> (BonusDistributor, Arc<Store>, SledDirectory, SledLedger) {
        let store = Arc::new(Store::open_temporary().unwrap());
        let directory = SledDirectory::open(store.db()).unwrap();
        let ledger = SledLedger::open(store.db()).unwrap();
        let distributor = BonusDistributor::new(
            store.clone(),
            Arc::new(directory.clone()),
            Arc::new(ledger.clone()),
        );
        (distributor, store, directory, ledger)
    }

    fn seed(directory: &SledDirectory, id: &str, active: bool) {
        directory
            .upsert(&Participant {
                id: id.to_string(),
                kind: ParticipantKind::User,
                region_id: "r1".to_string(),
                tier: 1,
                integral_score: 10,
                equity_score: 0,
                spend_total: Money::from_major(500),
                active,
            })
            .unwrap();
    }

    fn planned(id: &str, cents: i64) -> PlannedEntry {
        PlannedEntry {
            participant_id: id.to_string(),
            kind: ParticipantKind::User,
            amount: Money::from_cents(cents),
            weight_basis: WeightBasis::Integral,
        }
    }

    #[test]
    fn test_applies_and_records_entries() {
        let (distributor, store, directory, ledger) = harness();
        seed(&directory, "u-1", true);
        seed(&directory, "u-2", true);
        let outcome = distributor.apply(
            &[planned("u-1", 300), planned("u-2", 700)],
            "pool-1:periodic:1",
            "dividend",
        );
        assert_eq!(outcome.success, 2);
        assert_eq!(outcome.skipped, 0);
        assert!(outcome.failures.is_empty());
        assert_eq!(
            ledger.balance(ParticipantKind::User, "u-2").unwrap(),
            Money::from_cents(700)
        );
        assert_eq!(
            store
                .distributions
                .total_for_period("pool-1:periodic:1")
                .unwrap(),
            Money::from_cents(1000)
        );
    }

    #[test]
    fn test_replay_skips_everything() {
        let (distributor, store, directory, ledger) = harness();
        seed(&directory, "u-1", true);
        let entries = vec![planned("u-1", 300)];
        distributor.apply(&entries, "p-1", "dividend");
        let replay = distributor.apply(&entries, "p-1", "dividend");
        assert_eq!(replay.success, 0);
        assert_eq!(replay.skipped, 1);
        assert_eq!(
            ledger.balance(ParticipantKind::User, "u-1").unwrap(),
            Money::from_cents(300)
        );
        assert_eq!(store.distributions.for_period("p-1").unwrap().len(), 1);
    }

    #[test]
    fn test_inactive_participant_is_skip_not_failure() {
        let (distributor, _store, directory, ledger) = harness();
        seed(&directory, "u-1", false);
        let outcome = distributor.apply(&[planned("u-1", 300)], "p-1", "dividend");
        assert_eq!(outcome.success, 0);
        assert_eq!(outcome.skipped, 1);
        assert!(outcome.failures.is_empty());
        assert_eq!(
            ledger.balance(ParticipantKind::User, "u-1").unwrap(),
            Money::ZERO
        );
    }

    #[test]
    fn test_unknown_participant_skipped() {
        let (distributor, _store, _directory, _ledger) = harness();
        let outcome = distributor.apply(&[planned("ghost", 300)], "p-1", "dividend");
        assert_eq!(outcome.skipped, 1);
    }
}
