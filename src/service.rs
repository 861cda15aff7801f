//! Cycle orchestration.
//!
//! `DividendEngine` wires the components together and owns the payout
//! flow: sweep pools, plan due cycles, split the money, route entries
//! through the synchronous path or the async dispatcher, settle. Every
//! run serializes behind the global execution lock; a concurrent
//! invocation backs off with `AlreadyRunning`.

use crate::accumulator::{PaidFeeEvent, PoolAccumulator};
use crate::cache::DividendCache;
use crate::calculator;
use crate::config::EngineConfig;
use crate::directory::{Participant, ParticipantDirectory};
use crate::dispatch::{settle_cycle, AsyncDispatcher, CycleContext, FailedBatchPayload};
use crate::distributor::{BatchOutcome, BonusDistributor, PlannedEntry};
use crate::error::{EngineError, Result};
use crate::ledger::Ledger;
use crate::lock::{DistributedLock, GLOBAL_LOCK};
use crate::money::Money;
use crate::monitor::MonitorService;
use crate::store::{
    ExecuteType, ExecutionRecord, ParticipantKind, Pool, SharedStore, WeightBasis,
};
use crate::threshold::ThresholdEngine;
use chrono::{Datelike, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Pool id used for platform-level growth cycles, which are not backed
/// by any region pool. Region pool ids are db-generated and count up
/// from zero, so the sentinel sits at the top of the range.
const PLATFORM_POOL_ID: u64 = u64::MAX;

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub pools_checked: u64,
    pub cycles_executed: u64,
    pub amount_distributed: Money,
    pub growth_cycles: u64,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub pool: Pool,
    pub next_trigger: Money,
    pub due_now: bool,
    pub projected_payout: Money,
}

pub struct DividendEngine {
    config: EngineConfig,
    store: SharedStore,
    directory: Arc<dyn ParticipantDirectory>,
    accumulator: PoolAccumulator,
    threshold: ThresholdEngine,
    distributor: Arc<BonusDistributor>,
    dispatcher: AsyncDispatcher,
    lock: DistributedLock,
    cache: Arc<DividendCache>,
    pub monitor: Arc<MonitorService>,
}

impl DividendEngine {
    pub fn new(
        store: SharedStore,
        directory: Arc<dyn ParticipantDirectory>,
        ledger: Arc<dyn Ledger>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate().map_err(EngineError::Validation)?;
        let cache = Arc::new(DividendCache::new(
            config.participants_ttl_secs,
            config.last_record_ttl_secs,
            config.aggregates_ttl_secs,
        ));
        let distributor = Arc::new(BonusDistributor::new(
            store.clone(),
            directory.clone(),
            ledger.clone(),
        ));
        let dispatcher = AsyncDispatcher::new(
            config.clone(),
            distributor.clone(),
            store.clone(),
            cache.clone(),
        );
        let monitor = Arc::new(MonitorService::new(
            store.clone(),
            ledger,
            cache.clone(),
            config.monitor.clone(),
            config.conservation_tolerance,
        ));
        let lock = DistributedLock::open(store.db(), config.lock_ttl_secs)?;
        Ok(Self {
            accumulator: PoolAccumulator::new(store.clone(), config.clone()),
            threshold: ThresholdEngine::new(config.clone()),
            config,
            store,
            directory,
            distributor,
            dispatcher,
            lock,
            cache,
            monitor,
        })
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Ingest a paid-fee event.
    pub fn credit(&self, event: &PaidFeeEvent) -> Result<Option<u64>> {
        let pool_id = self.accumulator.credit(event)?;
        if let Some(_id) = pool_id {
            self.cache.invalidate_region(&event.region_id);
        }
        Ok(pool_id)
    }

    /// Evaluate every pool and settle all due cycles, plus the platform
    /// growth dividend. One sweep at a time, globally.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let pools = self.store.pools.all()?;
        if !self.any_cycles_due(&pools)? {
            // idle sweeps return without touching the lock
            let mut report = SweepReport::default();
            report.pools_checked = pools.len() as u64;
            return Ok(report);
        }

        let guard = self
            .lock
            .acquire(GLOBAL_LOCK)?
            .ok_or(EngineError::AlreadyRunning)?;
        let started = Instant::now();
        let mut report = SweepReport::default();

        // re-read under the lock; the pre-lock snapshot may be stale
        for pool in self.store.pools.all()? {
            report.pools_checked += 1;
            match self.run_periodic(&pool).await {
                Ok((cycles, amount)) => {
                    report.cycles_executed += cycles;
                    report.amount_distributed = report.amount_distributed.saturating_add(amount);
                }
                Err(err) if err.is_idempotent_noop() => {}
                Err(err) => {
                    // one pool failing must not starve the others
                    warn!("[SWEEP] pool {} failed: {}", pool.id, err);
                    report.errors.push(format!("pool {}: {}", pool.id, err));
                }
            }
        }

        match self.run_growth().await {
            Ok(Some(amount)) => {
                report.growth_cycles += 1;
                report.amount_distributed = report.amount_distributed.saturating_add(amount);
            }
            Ok(None) => {}
            Err(err) if err.is_idempotent_noop() => {}
            Err(err) => {
                warn!("[SWEEP] growth dividend failed: {}", err);
                report.errors.push(format!("growth: {}", err));
            }
        }

        self.monitor.note_cycle_duration(started.elapsed().as_secs());
        guard.release()?;
        info!(
            "[SWEEP] checked {} pool(s), executed {} cycle(s), distributed {}",
            report.pools_checked, report.cycles_executed, report.amount_distributed
        );
        Ok(report)
    }

    /// Cheap lock-free pass over pool and growth triggers. Everything
    /// is re-checked under the lock before any money moves.
    fn any_cycles_due(&self, pools: &[Pool]) -> Result<bool> {
        for pool in pools {
            let next_sequence = self.next_periodic_sequence(pool.id)?;
            if self.threshold.evaluate(pool, next_sequence).due {
                return Ok(true);
            }
        }
        let volume = Money::from_cents(self.store.platform_volume()?);
        let last = Money::from_cents(self.store.growth_last_threshold()?.unwrap_or(0));
        Ok(self.threshold.evaluate_growth(volume, last).is_some())
    }

    fn next_periodic_sequence(&self, pool_id: u64) -> Result<u64> {
        let store = self.store.clone();
        let last = self
            .cache
            .last_record
            .get_or_compute(pool_id, move || store.executions.last_periodic(pool_id))?;
        Ok(last.map(|r| r.cycle_sequence + 1).unwrap_or(1))
    }

    /// Settle all periodic cycles one pool is due for.
    async fn run_periodic(&self, pool: &Pool) -> Result<(u64, Money)> {
        let next_sequence = self.next_periodic_sequence(pool.id)?;
        let evaluation = self.threshold.evaluate(pool, next_sequence);
        if !evaluation.due {
            return Ok((0, Money::ZERO));
        }

        let participants = self.region_snapshot(&pool.region_id)?;
        let mut executed = 0;
        let mut distributed = Money::ZERO;
        for plan in &evaluation.cycles {
            // re-check under the lock before doing any work
            if self
                .store
                .executions
                .find(pool.id, ExecuteType::Periodic, plan.sequence)?
                .is_some()
            {
                warn!(
                    "[SWEEP] pool {} cycle {} already executed, skipping",
                    pool.id, plan.sequence
                );
                continue;
            }

            let actual = plan.payout_base.mul_bps(self.config.payout_share_bps);
            let deduct = plan.payout_base.saturating_sub(actual);
            let entries = self.plan_periodic_entries(&participants, actual);
            let planned: Money = entries.iter().map(|e| e.amount).sum();
            let context = CycleContext {
                period_id: ExecutionRecord::cycle_key(
                    pool.id,
                    ExecuteType::Periodic,
                    plan.sequence,
                ),
                execute_type: ExecuteType::Periodic,
                pool_id: pool.id,
                region_id: Some(pool.region_id.clone()),
                cycle_sequence: plan.sequence,
                total_amount_at_execution: pool.available_amount,
                planned_amount: planned,
                deduct_amount: deduct,
                threshold_before: plan.threshold_before,
                threshold_after: plan.threshold_after,
                growth_rate_applied: self.config.growth_rate_bps,
                category: "dividend".to_string(),
            };
            let (_, actual_paid) = self.settle(context, entries).await?;
            executed += 1;
            distributed = distributed.saturating_add(actual_paid);
        }
        Ok((executed, distributed))
    }

    /// Monthly seed for every pool; fires once per `YYYYMM` key.
    pub async fn run_monthly(&self) -> Result<SweepReport> {
        let month_key = Self::month_key();
        // already seeded this month; skip without touching the lock
        if self.store.last_monthly_key()?.map_or(false, |k| k >= month_key) {
            return Ok(SweepReport::default());
        }

        let guard = self
            .lock
            .acquire(GLOBAL_LOCK)?
            .ok_or(EngineError::AlreadyRunning)?;
        let mut report = SweepReport::default();

        for pool in self.store.pools.all()? {
            report.pools_checked += 1;
            match self.run_monthly_pool(&pool, month_key).await {
                Ok(Some(amount)) => {
                    report.cycles_executed += 1;
                    report.amount_distributed = report.amount_distributed.saturating_add(amount);
                }
                Ok(None) => {}
                Err(err) if err.is_idempotent_noop() => {}
                Err(err) => {
                    warn!("[SWEEP] monthly seed for pool {} failed: {}", pool.id, err);
                    report.errors.push(format!("pool {}: {}", pool.id, err));
                }
            }
        }

        self.store.set_last_monthly_key(month_key)?;
        guard.release()?;
        Ok(report)
    }

    async fn run_monthly_pool(&self, pool: &Pool, month_key: u64) -> Result<Option<Money>> {
        if self
            .store
            .executions
            .find(pool.id, ExecuteType::Monthly, month_key)?
            .is_some()
        {
            return Err(EngineError::AlreadyExecuted);
        }
        let seed = calculator::monthly_seed(pool.available_amount, &self.config);
        if !seed.should_distribute {
            return Ok(None);
        }

        let participants = self.region_snapshot(&pool.region_id)?;
        let entries = self.plan_monthly_entries(&participants, seed.distribute_amount);
        let planned: Money = entries.iter().map(|e| e.amount).sum();
        let context = CycleContext {
            period_id: ExecutionRecord::cycle_key(pool.id, ExecuteType::Monthly, month_key),
            execute_type: ExecuteType::Monthly,
            pool_id: pool.id,
            region_id: Some(pool.region_id.clone()),
            cycle_sequence: month_key,
            total_amount_at_execution: pool.available_amount,
            planned_amount: planned,
            deduct_amount: seed.remain_amount,
            // the monthly seed does not move the periodic threshold
            threshold_before: pool.last_threshold_amount,
            threshold_after: pool.last_threshold_amount,
            growth_rate_applied: 0,
            category: "monthly_seed".to_string(),
        };
        let (_, actual) = self.settle(context, entries).await?;
        Ok(Some(actual))
    }

    /// Platform growth dividend: one trigger per sweep at most.
    async fn run_growth(&self) -> Result<Option<Money>> {
        let volume = Money::from_cents(self.store.platform_volume()?);
        let last = Money::from_cents(self.store.growth_last_threshold()?.unwrap_or(0));
        let trigger = match self.threshold.evaluate_growth(volume, last) {
            Some(trigger) => trigger,
            None => return Ok(None),
        };

        let sequence = self.store.bump_growth_cycle_sequence()?;
        let mut per_order = Vec::new();
        let mut by_owner: BTreeMap<String, Money> = BTreeMap::new();
        for order in self.store.growth.all()? {
            let payout = match calculator::growth_payout(
                order.handling_fee,
                order.cycles_paid,
                order.last_payout,
                &self.config,
            ) {
                Some(payout) if payout.is_positive() => payout,
                _ => continue,
            };
            let slot = by_owner.entry(order.owner_id.clone()).or_insert(Money::ZERO);
            *slot = slot.saturating_add(payout);
            per_order.push((order.order_id, payout));
        }

        let entries: Vec<PlannedEntry> = by_owner
            .into_iter()
            .map(|(owner, amount)| PlannedEntry {
                participant_id: owner,
                kind: ParticipantKind::User,
                amount,
                weight_basis: WeightBasis::Count,
            })
            .collect();
        let planned: Money = entries.iter().map(|e| e.amount).sum();

        let context = CycleContext {
            period_id: ExecutionRecord::cycle_key(PLATFORM_POOL_ID, ExecuteType::Growth, sequence),
            execute_type: ExecuteType::Growth,
            pool_id: PLATFORM_POOL_ID,
            region_id: None,
            cycle_sequence: sequence,
            total_amount_at_execution: volume,
            planned_amount: planned,
            deduct_amount: Money::ZERO,
            threshold_before: trigger.threshold_before,
            threshold_after: trigger.threshold_after,
            growth_rate_applied: self.config.growth_rate_bps,
            category: "growth_dividend".to_string(),
        };
        let (_, actual) = self.settle(context, entries).await?;

        for (order_id, payout) in per_order {
            self.store.growth.record_payout(&order_id, payout)?;
        }
        self.store
            .set_growth_last_threshold(trigger.threshold_after.cents())?;
        info!(
            "[SWEEP] growth cycle {} paid {} at volume {}",
            sequence, actual, volume
        );
        Ok(Some(actual))
    }

    /// Route a planned cycle through the sync path or the dispatcher.
    async fn settle(
        &self,
        context: CycleContext,
        entries: Vec<PlannedEntry>,
    ) -> Result<(BatchOutcome, Money)> {
        if entries.len() >= self.config.async_threshold {
            let receipt = self.dispatcher.dispatch(context, entries).await?;
            let report = receipt.completion.await.map_err(|_| {
                EngineError::Persistence("dispatcher dropped the cycle".to_string())
            })?;
            Ok((report.outcome, report.actual_distributed))
        } else {
            let outcome = self
                .distributor
                .apply(&entries, &context.period_id, &context.category);
            let (_, actual) = settle_cycle(
                self.store.as_ref(),
                self.cache.as_ref(),
                self.config.conservation_tolerance,
                &context,
                0,
            )?;
            Ok((outcome, actual))
        }
    }

    /// Split one periodic payout: a team share divided equally among
    /// ranked participants, the rest proportional to integral score.
    /// Per-participant amounts merge into a single entry so the
    /// period's idempotency key stays one-per-participant.
    fn plan_periodic_entries(
        &self,
        participants: &[Participant],
        actual: Money,
    ) -> Vec<PlannedEntry> {
        if !actual.is_positive() {
            return Vec::new();
        }
        let mut amounts: BTreeMap<(ParticipantKind, String), (Money, WeightBasis)> =
            BTreeMap::new();

        let team: Vec<&Participant> = participants.iter().filter(|p| p.tier >= 1).collect();
        let team_pool = actual.mul_bps(self.config.team_share_bps);
        let per_member = team_pool.split_equal(team.len());
        let mut team_paid = Money::ZERO;
        for member in &team {
            if per_member < self.config.min_payout {
                break;
            }
            amounts.insert(
                (member.kind, member.id.clone()),
                (per_member, WeightBasis::Count),
            );
            team_paid = team_paid.saturating_add(per_member);
        }

        // equal-split dust and the whole team share (when nobody is
        // ranked) flow into the integral portion
        let integral_pool = actual.saturating_sub(team_paid);
        let eligible: Vec<&Participant> = participants
            .iter()
            .filter(|p| p.integral_score > 0 && p.spend_total >= self.config.min_spend_eligibility)
            .collect();
        for (index, share) in calculator::proportional_split(
            &eligible,
            integral_pool,
            self.config.min_payout,
            |p| p.integral_score as u128,
        ) {
            let member = eligible[index];
            let key = (member.kind, member.id.clone());
            match amounts.get_mut(&key) {
                Some((amount, basis)) => {
                    *amount = amount.saturating_add(share);
                    *basis = WeightBasis::Integral;
                }
                None => {
                    amounts.insert(key, (share, WeightBasis::Integral));
                }
            }
        }

        amounts
            .into_iter()
            .map(|((kind, id), (amount, basis))| PlannedEntry {
                participant_id: id,
                kind,
                amount,
                weight_basis: basis,
            })
            .collect()
    }

    /// Monthly seed split: half to users weighted by integral score,
    /// half to merchants weighted by lifetime spend.
    fn plan_monthly_entries(
        &self,
        participants: &[Participant],
        distribute: Money,
    ) -> Vec<PlannedEntry> {
        let user_pool = distribute.mul_bps(self.config.user_share_bps);
        let merchant_pool = distribute.saturating_sub(user_pool);
        let mut entries = Vec::new();

        let users: Vec<&Participant> = participants
            .iter()
            .filter(|p| {
                p.kind == ParticipantKind::User
                    && p.integral_score > 0
                    && p.spend_total >= self.config.min_spend_eligibility
            })
            .collect();
        for (index, amount) in calculator::proportional_split(
            &users,
            user_pool,
            self.config.min_payout,
            |p| p.integral_score as u128,
        ) {
            entries.push(PlannedEntry {
                participant_id: users[index].id.clone(),
                kind: ParticipantKind::User,
                amount,
                weight_basis: WeightBasis::Integral,
            });
        }

        let merchants: Vec<&Participant> = participants
            .iter()
            .filter(|p| p.kind == ParticipantKind::Merchant && p.spend_total.is_positive())
            .collect();
        for (index, amount) in calculator::proportional_split(
            &merchants,
            merchant_pool,
            self.config.min_payout,
            |p| p.spend_total.cents() as u128,
        ) {
            entries.push(PlannedEntry {
                participant_id: merchants[index].id.clone(),
                kind: ParticipantKind::Merchant,
                amount,
                weight_basis: WeightBasis::Equity,
            });
        }
        entries
    }

    fn region_snapshot(&self, region_id: &str) -> Result<Vec<Participant>> {
        let directory = self.directory.clone();
        let region = region_id.to_string();
        self.cache
            .participants
            .get_or_compute(region_id.to_string(), move || directory.for_region(&region))
    }

    /// Status view for one region's pool.
    pub fn pool_status(&self, region_id: &str) -> Result<Option<PoolStatus>> {
        let pool = match self.store.pools.get(region_id)? {
            Some(pool) => pool,
            None => return Ok(None),
        };
        let baseline = if pool.last_threshold_amount.is_positive() {
            pool.last_threshold_amount
        } else {
            pool.initial_threshold
        };
        let preview = calculator::periodic_bonus(
            pool.available_amount,
            baseline,
            self.config.growth_rate_bps,
        );
        Ok(Some(PoolStatus {
            next_trigger: baseline.grow_bps(self.config.growth_rate_bps),
            due_now: preview.should_distribute,
            projected_payout: preview.actual_amount,
            pool,
        }))
    }

    /// Operator retry of a parked batch. Replays the payload through
    /// the distributor; duplicates skip, so a partially-applied batch
    /// completes instead of double-paying.
    pub fn retry_failed_job(&self, job_id: u64) -> Result<BatchOutcome> {
        let job = self
            .store
            .failed_jobs
            .get(job_id)?
            .ok_or_else(|| EngineError::Validation(format!("no failed job {}", job_id)))?;
        if job.resolved {
            return Err(EngineError::AlreadyExecuted);
        }
        let payload: FailedBatchPayload = bincode::deserialize(&job.payload)?;
        let outcome = self
            .distributor
            .apply(&payload.entries, &payload.period_id, &payload.category);
        if outcome.failures.is_empty() {
            // settle before resolving, so a settle failure leaves the
            // job retryable (the replay itself is duplicate-safe)
            self.settle_replayed_cycle(&payload.period_id)?;
            self.store.failed_jobs.mark_resolved(job_id)?;
            info!("[FAILED_JOBS] job {} replayed and resolved", job_id);
        }
        Ok(outcome)
    }

    /// Fold a replayed batch back into the books. The cycle settled
    /// without its entries, so the record undercounts and the pool still
    /// holds the money. Recompute the period total from the entry tree,
    /// debit the pool for the difference, amend the record.
    fn settle_replayed_cycle(&self, period_id: &str) -> Result<()> {
        let (pool_id, execute_type, sequence) = ExecutionRecord::parse_cycle_key(period_id)
            .ok_or_else(|| EngineError::Validation(format!("malformed period id {}", period_id)))?;
        let mut record = match self.store.executions.find(pool_id, execute_type, sequence)? {
            Some(record) => record,
            None => return Ok(()),
        };
        let actual = self.store.distributions.total_for_period(period_id)?;
        let delta = actual.saturating_sub(record.actual_distributed);
        if !delta.is_positive() {
            return Ok(());
        }

        // growth cycles have no region pool behind them
        if let Some(pool) = self.store.pools.get_by_id(pool_id)? {
            self.store
                .pools
                .apply_distribution(&pool.region_id, delta, pool.last_threshold_amount)?;
        }
        let (user_count, merchant_count) = self.store.distributions.count_for_period(period_id)?;
        record.actual_distributed = actual;
        record.user_count = user_count;
        record.merchant_count = merchant_count;
        self.store.executions.amend(&record)?;
        self.cache.invalidate_pool(pool_id);
        crate::metrics::DISTRIBUTED_CENTS_TOTAL
            .with_label_values(&[&execute_type.to_string()])
            .inc_by(delta.cents().max(0) as u64);
        info!(
            "[FAILED_JOBS] replay settled {}: {} more distributed, cycle total now {}",
            period_id, delta, actual
        );
        self.store.flush()?;
        Ok(())
    }

    /// True once the calendar month has rolled past the last seed run.
    pub fn monthly_due(&self) -> Result<bool> {
        let current = Self::month_key();
        Ok(self.store.last_monthly_key()?.map_or(true, |k| k < current))
    }

    fn month_key() -> u64 {
        let now = Utc::now();
        now.year() as u64 * 100 + now.month() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::AuditStatus;
    use crate::directory::SledDirectory;
    use crate::ledger::SledLedger;
    use crate::store::Store;

    fn engine() -> (DividendEngine, SledDirectory, SledLedger) {
        let store = Arc::new(Store::open_temporary().unwrap());
        let directory = SledDirectory::open(store.db()).unwrap();
        let ledger = SledLedger::open(store.db()).unwrap();
        let config = EngineConfig {
            retry_delay_ms: 5,
            ..Default::default()
        };
        let engine = DividendEngine::new(
            store,
            Arc::new(directory.clone()),
            Arc::new(ledger.clone()),
            config,
        )
        .unwrap();
        (engine, directory, ledger)
    }

    fn seed_user(directory: &SledDirectory, id: &str, tier: u8, integral: u64) {
        directory
            .upsert(&Participant {
                id: id.to_string(),
                kind: ParticipantKind::User,
                region_id: "r1".to_string(),
                tier,
                integral_score: integral,
                equity_score: 0,
                spend_total: Money::from_major(500),
                active: true,
            })
            .unwrap();
    }

    fn paid_event(order: &str, fee_major: i64) -> PaidFeeEvent {
        PaidFeeEvent {
            order_id: order.to_string(),
            region_id: "r1".to_string(),
            buyer_id: "u-1".to_string(),
            pay_amount: Money::from_major(fee_major * 10),
            handling_fee: Money::from_major(fee_major),
            paid_at: Utc::now().timestamp(),
            paid: true,
            audit_status: AuditStatus::Approved,
        }
    }

    #[test]
    fn test_periodic_split_conserves_and_merges() {
        let (engine, directory, _) = engine();
        seed_user(&directory, "u-1", 1, 10);
        seed_user(&directory, "u-2", 0, 20);
        seed_user(&directory, "u-3", 2, 70);
        let participants = directory.for_region("r1").unwrap();
        let entries = engine.plan_periodic_entries(&participants, Money::from_major(1_000));
        // one entry per participant even when both shares apply
        assert_eq!(entries.len(), 3);
        let total: Money = entries.iter().map(|e| e.amount).sum();
        assert_eq!(total, Money::from_major(1_000));
        // team members get the equal share on top of their integral cut
        let u1 = entries.iter().find(|e| e.participant_id == "u-1").unwrap();
        let u2 = entries.iter().find(|e| e.participant_id == "u-2").unwrap();
        // 30% of 1000 split between u-1 and u-3; 70% split 10/20/70
        assert_eq!(u1.amount, Money::from_major(150 + 70));
        assert_eq!(u2.amount, Money::from_major(140));
    }

    #[test]
    fn test_periodic_split_without_team_goes_all_integral() {
        let (engine, directory, _) = engine();
        seed_user(&directory, "u-1", 0, 1);
        seed_user(&directory, "u-2", 0, 1);
        let participants = directory.for_region("r1").unwrap();
        let entries = engine.plan_periodic_entries(&participants, Money::from_major(100));
        let total: Money = entries.iter().map(|e| e.amount).sum();
        assert_eq!(total, Money::from_major(100));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sweep_executes_due_cycle_end_to_end() {
        let (engine, directory, _ledger) = engine();
        seed_user(&directory, "u-1", 1, 30);
        seed_user(&directory, "u-2", 0, 70);

        // first credit seeds the threshold at 4000; the second pushes
        // available to 4700, just past the 4600 trigger
        engine.credit(&paid_event("ord-1", 10_000)).unwrap();
        engine.credit(&paid_event("ord-2", 1_750)).unwrap();

        let report = engine.sweep().await.unwrap();
        assert_eq!(report.pools_checked, 1);
        assert_eq!(report.cycles_executed, 1);
        assert_eq!(report.growth_cycles, 1);
        assert!(report.errors.is_empty());

        let pool = engine.store().pools.get("r1").unwrap().unwrap();
        // threshold compounded once from the 4000 seed
        assert_eq!(pool.last_threshold_amount, Money::from_major(4_600));
        assert!(pool.invariant_holds());
        // payout base 600, 60% actually paid
        assert_eq!(pool.distributed_amount, Money::from_major(360));
        let period = ExecutionRecord::cycle_key(pool.id, ExecuteType::Periodic, 1);
        assert_eq!(
            engine.store().distributions.total_for_period(&period).unwrap(),
            Money::from_major(360)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_second_sweep_is_clean_noop() {
        let (engine, directory, _) = engine();
        seed_user(&directory, "u-1", 1, 10);
        engine.credit(&paid_event("ord-1", 10_000)).unwrap();
        engine.credit(&paid_event("ord-2", 1_750)).unwrap();

        let first = engine.sweep().await.unwrap();
        assert_eq!(first.cycles_executed, 1);
        let second = engine.sweep().await.unwrap();
        assert_eq!(second.cycles_executed, 0);
        assert_eq!(engine.store().executions.for_pool(
            engine.store().pools.get("r1").unwrap().unwrap().id
        ).unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_monthly_seed_pays_and_is_once_per_month() {
        let (engine, directory, _) = engine();
        seed_user(&directory, "u-1", 0, 10);
        // merchant weighted by spend
        directory
            .upsert(&Participant {
                id: "m-1".to_string(),
                kind: ParticipantKind::Merchant,
                region_id: "r1".to_string(),
                tier: 0,
                integral_score: 0,
                equity_score: 0,
                spend_total: Money::from_major(2_000),
                active: true,
            })
            .unwrap();
        // 125000 fee -> 50000 pool
        engine.credit(&paid_event("ord-1", 125_000)).unwrap();

        let report = engine.run_monthly().await.unwrap();
        assert_eq!(report.cycles_executed, 1);
        // 50000 - 20000 reserve = 30000; 60% = 18000 distributed
        assert_eq!(report.amount_distributed, Money::from_major(18_000));
        let pool = engine.store().pools.get("r1").unwrap().unwrap();
        assert_eq!(pool.available_amount, Money::from_major(32_000));
        assert!(pool.invariant_holds());

        assert!(!engine.monthly_due().unwrap());
        let rerun = engine.run_monthly().await.unwrap();
        assert_eq!(rerun.cycles_executed, 0);
        assert!(rerun.errors.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_growth_dividend_fires_once_per_threshold() {
        let (engine, directory, ledger) = engine();
        seed_user(&directory, "u-1", 0, 10);
        // pay volume 1000 (fee 100), clearing the initial 1000 threshold
        engine.credit(&paid_event("ord-1", 100)).unwrap();

        let report = engine.sweep().await.unwrap();
        assert_eq!(report.growth_cycles, 1);
        // first growth cycle pays 25% of the order's 100 fee
        assert_eq!(
            ledger.balance(ParticipantKind::User, "u-1").unwrap(),
            Money::from_major(25)
        );
        let state = engine.store().growth.get("ord-1").unwrap().unwrap();
        assert_eq!(state.cycles_paid, 1);
        assert_eq!(state.last_payout, Money::from_major(25));

        // volume unchanged: the next sweep must not fire again
        let report = engine.sweep().await.unwrap();
        assert_eq!(report.growth_cycles, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_idle_sweep_does_not_contend_on_lock() {
        let (engine, directory, _) = engine();
        seed_user(&directory, "u-1", 0, 10);
        // fee 50 seeds the pool at 20 with the trigger at 23, and the
        // 500 volume stays under the 1000 growth threshold
        engine.credit(&paid_event("ord-1", 50)).unwrap();

        let lock = DistributedLock::open(engine.store().db(), 300).unwrap();
        let held = lock.acquire(GLOBAL_LOCK).unwrap().unwrap();

        // nothing due: the sweep returns without trying the lock
        let report = engine.sweep().await.unwrap();
        assert_eq!(report.pools_checked, 1);
        assert_eq!(report.cycles_executed, 0);

        // past the trigger the sweep needs the lock and must back off
        engine.credit(&paid_event("ord-2", 10_000)).unwrap();
        let err = engine.sweep().await.unwrap_err();
        assert!(matches!(err, EngineError::AlreadyRunning));
        held.release().unwrap();
    }

    #[test]
    fn test_pool_status_previews_next_cycle() {
        let (engine, _, _) = engine();
        engine.credit(&paid_event("ord-1", 10_000)).unwrap();
        let status = engine.pool_status("r1").unwrap().unwrap();
        // pool seeded at 4000
        assert_eq!(status.next_trigger, Money::from_major(4_600));
        assert!(!status.due_now);
        assert!(engine.pool_status("nowhere").unwrap().is_none());
    }
}
