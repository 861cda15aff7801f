//! Participant balance ledger.
//!
//! The billing collaborator's contract: `credit_balance` writes an
//! immutable credit row and bumps the participant balance in one
//! multi-tree transaction. Credits are keyed by the caller-supplied
//! reference id, so replaying the same payout is a detected duplicate,
//! not a double credit.

use crate::error::{EngineError, Result};
use crate::money::Money;
use crate::store::ParticipantKind;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sled::transaction::ConflictableTransactionError;
use sled::Transactional;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerCredit {
    pub reference_id: String,
    pub participant_type: ParticipantKind,
    pub participant_id: String,
    pub amount: Money,
    pub category: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditOutcome {
    Applied,
    Duplicate,
}

pub trait Ledger: Send + Sync {
    /// Credit a participant balance, idempotent on `reference_id`.
    fn credit_balance(
        &self,
        kind: ParticipantKind,
        participant_id: &str,
        amount: Money,
        reference_id: &str,
        category: &str,
    ) -> Result<CreditOutcome>;

    fn balance(&self, kind: ParticipantKind, participant_id: &str) -> Result<Money>;

    /// All credits whose reference id starts with `prefix` (reconcile
    /// scans use the period id as the prefix).
    fn credits_with_prefix(&self, prefix: &str) -> Result<Vec<LedgerCredit>>;
}

const TREE_CREDITS: &str = "ledger_credits";
const TREE_BALANCES: &str = "ledger_balances";

#[derive(Clone)]
pub struct SledLedger {
    credits: sled::Tree,
    balances: sled::Tree,
}

impl SledLedger {
    pub fn open(db: &sled::Db) -> Result<Self> {
        Ok(Self {
            credits: db.open_tree(TREE_CREDITS)?,
            balances: db.open_tree(TREE_BALANCES)?,
        })
    }

    fn balance_key(kind: ParticipantKind, id: &str) -> String {
        format!("{}:{}", kind, id)
    }
}

impl Ledger for SledLedger {
    fn credit_balance(
        &self,
        kind: ParticipantKind,
        participant_id: &str,
        amount: Money,
        reference_id: &str,
        category: &str,
    ) -> Result<CreditOutcome> {
        if !amount.is_positive() {
            return Err(EngineError::Validation(format!(
                "ledger credit must be positive, got {}",
                amount
            )));
        }
        let credit = LedgerCredit {
            reference_id: reference_id.to_string(),
            participant_type: kind,
            participant_id: participant_id.to_string(),
            amount,
            category: category.to_string(),
            created_at: Utc::now().timestamp(),
        };
        let credit_bytes = crate::store::encode(&credit)?;
        let balance_key = Self::balance_key(kind, participant_id);

        let outcome = (&self.credits, &self.balances).transaction(move |(credits, balances)| {
            if credits.get(reference_id.as_bytes())?.is_some() {
                return Ok(CreditOutcome::Duplicate);
            }
            credits.insert(reference_id.as_bytes(), credit_bytes.clone())?;
            let current = balances
                .get(balance_key.as_bytes())?
                .map(|v| crate::store::decode_i64(&v))
                .unwrap_or(0);
            let next = current.saturating_add(amount.cents());
            balances.insert(balance_key.as_bytes(), &next.to_be_bytes())?;
            Ok::<_, ConflictableTransactionError<EngineError>>(CreditOutcome::Applied)
        })?;
        Ok(outcome)
    }

    fn balance(&self, kind: ParticipantKind, participant_id: &str) -> Result<Money> {
        let key = Self::balance_key(kind, participant_id);
        Ok(self
            .balances
            .get(key.as_bytes())?
            .map(|v| Money::from_cents(crate::store::decode_i64(&v)))
            .unwrap_or(Money::ZERO))
    }

    fn credits_with_prefix(&self, prefix: &str) -> Result<Vec<LedgerCredit>> {
        let mut found = Vec::new();
        for item in self.credits.scan_prefix(prefix.as_bytes()) {
            let (_, value) = item?;
            found.push(crate::store::decode(&value)?);
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> SledLedger {
        let db = sled::Config::new().temporary(true).open().unwrap();
        SledLedger::open(&db).unwrap()
    }

    #[test]
    fn test_credit_applies_once() {
        let ledger = ledger();
        let outcome = ledger
            .credit_balance(
                ParticipantKind::User,
                "u-1",
                Money::from_cents(500),
                "p-1:user:u-1",
                "dividend",
            )
            .unwrap();
        assert_eq!(outcome, CreditOutcome::Applied);

        // replay with the same reference is flagged and leaves the
        // balance untouched
        let outcome = ledger
            .credit_balance(
                ParticipantKind::User,
                "u-1",
                Money::from_cents(500),
                "p-1:user:u-1",
                "dividend",
            )
            .unwrap();
        assert_eq!(outcome, CreditOutcome::Duplicate);
        assert_eq!(
            ledger.balance(ParticipantKind::User, "u-1").unwrap(),
            Money::from_cents(500)
        );
    }

    #[test]
    fn test_rejects_non_positive_credit() {
        let ledger = ledger();
        assert!(ledger
            .credit_balance(
                ParticipantKind::User,
                "u-1",
                Money::ZERO,
                "ref",
                "dividend"
            )
            .is_err());
    }

    #[test]
    fn test_prefix_scan_finds_period_credits() {
        let ledger = ledger();
        for i in 0..3 {
            ledger
                .credit_balance(
                    ParticipantKind::User,
                    &format!("u-{}", i),
                    Money::from_cents(100 + i),
                    &format!("p-1:user:u-{}", i),
                    "dividend",
                )
                .unwrap();
        }
        ledger
            .credit_balance(
                ParticipantKind::User,
                "u-9",
                Money::from_cents(777),
                "p-2:user:u-9",
                "dividend",
            )
            .unwrap();
        let credits = ledger.credits_with_prefix("p-1:").unwrap();
        assert_eq!(credits.len(), 3);
        let total: Money = credits.iter().map(|c| c.amount).sum();
        assert_eq!(total, Money::from_cents(303));
    }
}
