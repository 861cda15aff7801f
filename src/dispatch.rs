//! Async batch fan-out and fan-in.
//!
//! Large participant sets are chunked into fixed-size batches and fed
//! to a tokio worker pool over an mpsc queue. Each cycle registers a
//! barrier holding the remaining-batch count; the last batch to finish
//! (successfully or declared dead after retries) drops the counter to
//! zero and triggers finalize, which recomputes totals from the entry
//! tree, writes the execution record, updates the pool, and invalidates
//! caches. A dead batch still decrements the barrier so finalize always
//! runs and can report the deficit.

use crate::cache::DividendCache;
use crate::config::EngineConfig;
use crate::distributor::{BatchOutcome, BonusDistributor, PlannedEntry};
use crate::error::Result;
use crate::money::Money;
use crate::store::{ExecuteType, ExecutionRecord, SharedStore};
use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Everything finalize needs to close out a cycle.
#[derive(Debug, Clone)]
pub struct CycleContext {
    pub period_id: String,
    pub execute_type: ExecuteType,
    pub pool_id: u64,
    /// Region pool to debit on finalize; `None` for cycles that do not
    /// draw from a region pool.
    pub region_id: Option<String>,
    pub cycle_sequence: u64,
    pub total_amount_at_execution: Money,
    pub planned_amount: Money,
    pub deduct_amount: Money,
    pub threshold_before: Money,
    pub threshold_after: Money,
    pub growth_rate_applied: u32,
    pub category: String,
}

/// Receipt handed back at enqueue time.
pub struct DispatchReceipt {
    pub period_id: String,
    pub batches: usize,
    /// Operator-facing ETA only; finalize actually fires via the barrier.
    pub estimated_finalize_secs: u64,
    pub completion: oneshot::Receiver<FinalizeReport>,
}

#[derive(Debug)]
pub struct FinalizeReport {
    pub outcome: BatchOutcome,
    pub record_written: bool,
    pub actual_distributed: Money,
    pub dead_batches: u64,
}

/// Payload parked with a FailedJob when a batch dies.
#[derive(Debug, Serialize, Deserialize)]
pub struct FailedBatchPayload {
    pub period_id: String,
    pub category: String,
    pub entries: Vec<PlannedEntry>,
}

struct CycleBarrier {
    context: CycleContext,
    remaining: AtomicUsize,
    dead_batches: AtomicU64,
    outcome: Mutex<BatchOutcome>,
    completion: Mutex<Option<oneshot::Sender<FinalizeReport>>>,
}

struct BatchJob {
    entries: Vec<PlannedEntry>,
    barrier: Arc<CycleBarrier>,
}

struct DispatcherInner {
    config: EngineConfig,
    distributor: Arc<BonusDistributor>,
    store: SharedStore,
    cache: Arc<DividendCache>,
}

pub struct AsyncDispatcher {
    tx: mpsc::Sender<BatchJob>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<BatchJob>>>,
    workers_started: AtomicBool,
    inner: Arc<DispatcherInner>,
}

/// Rough finalize ETA for the receipt: 30s per batch, clamped to
/// [60, 600]. Finalize itself fires via the barrier, not a timer.
pub fn legacy_finalize_delay_secs(entry_count: usize, batch_size: usize) -> u64 {
    let batches = entry_count.div_ceil(batch_size.max(1)) as u64;
    (batches * 30).clamp(60, 600)
}

impl AsyncDispatcher {
    pub fn new(
        config: EngineConfig,
        distributor: Arc<BonusDistributor>,
        store: SharedStore,
        cache: Arc<DividendCache>,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<BatchJob>(config.worker_count.max(1) * 4);
        let inner = Arc::new(DispatcherInner {
            config,
            distributor,
            store,
            cache,
        });
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            workers_started: AtomicBool::new(false),
            inner,
        }
    }

    /// Workers spawn on first dispatch, not at construction, so the
    /// engine can be built outside a running runtime.
    fn ensure_workers(&self) {
        if self.workers_started.swap(true, Ordering::SeqCst) {
            return;
        }
        for worker_id in 0..self.inner.config.worker_count.max(1) {
            let rx = self.rx.clone();
            let inner = self.inner.clone();
            tokio::spawn(async move {
                loop {
                    let job = { rx.lock().await.recv().await };
                    match job {
                        Some(job) => inner.process_batch(worker_id, job).await,
                        None => break,
                    }
                }
            });
        }
    }

    /// Chunk the entries, arm the barrier, enqueue the batches.
    pub async fn dispatch(
        &self,
        context: CycleContext,
        entries: Vec<PlannedEntry>,
    ) -> Result<DispatchReceipt> {
        self.ensure_workers();
        let batch_size = self.inner.config.batch_size.max(1);
        let chunks: Vec<Vec<PlannedEntry>> = entries
            .chunks(batch_size)
            .map(|c| c.to_vec())
            .collect();
        let batches = chunks.len().max(1);
        let (done_tx, done_rx) = oneshot::channel();
        let barrier = Arc::new(CycleBarrier {
            context: context.clone(),
            remaining: AtomicUsize::new(batches),
            dead_batches: AtomicU64::new(0),
            outcome: Mutex::new(BatchOutcome::default()),
            completion: Mutex::new(Some(done_tx)),
        });

        info!(
            "[DISPATCH] cycle {} fanning out {} entries in {} batch(es)",
            context.period_id,
            entries.len(),
            batches
        );

        if chunks.is_empty() {
            // nothing to pay; run finalize directly so the record and
            // pool update still happen
            self.inner.batch_done(barrier.clone(), BatchOutcome::default(), false).await;
        } else {
            for chunk in chunks {
                crate::metrics::QUEUE_DEPTH.inc();
                if self
                    .tx
                    .send(BatchJob {
                        entries: chunk,
                        barrier: barrier.clone(),
                    })
                    .await
                    .is_err()
                {
                    crate::metrics::QUEUE_DEPTH.dec();
                    return Err(crate::error::EngineError::Persistence(
                        "dispatch queue is closed".to_string(),
                    ));
                }
            }
        }

        Ok(DispatchReceipt {
            period_id: context.period_id,
            batches,
            estimated_finalize_secs: legacy_finalize_delay_secs(entries.len(), batch_size),
            completion: done_rx,
        })
    }
}

impl DispatcherInner {
    async fn process_batch(&self, worker_id: usize, job: BatchJob) {
        let period_id = job.barrier.context.period_id.clone();
        let category = job.barrier.context.category.clone();
        let max_attempts = self.config.max_retries.max(1);

        let mut outcome = BatchOutcome::default();
        let mut dead = false;
        for attempt in 1..=max_attempts {
            outcome = self
                .distributor
                .apply(&job.entries, &period_id, &category);
            if outcome.failures.is_empty() {
                break;
            }
            if attempt == max_attempts {
                dead = true;
                self.park_dead_batch(&job, &outcome, attempt);
                break;
            }
            let backoff = self.backoff_ms(attempt);
            warn!(
                "[DISPATCH] worker {} batch in {} had {} failure(s), retry {} in {}ms",
                worker_id,
                period_id,
                outcome.failures.len(),
                attempt + 1,
                backoff
            );
            tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
        }

        crate::metrics::QUEUE_DEPTH.dec();
        self.batch_done(job.barrier, outcome, dead).await;
    }

    fn backoff_ms(&self, attempt: u32) -> u64 {
        let base = self.config.retry_delay_ms.max(1) * attempt as u64;
        let jitter = rand::thread_rng().gen_range(0..=base / 2);
        base + jitter
    }

    fn park_dead_batch(&self, job: &BatchJob, outcome: &BatchOutcome, attempts: u32) {
        let payload = FailedBatchPayload {
            period_id: job.barrier.context.period_id.clone(),
            category: job.barrier.context.category.clone(),
            entries: job.entries.clone(),
        };
        let message = outcome
            .failures
            .first()
            .map(|f| f.message.clone())
            .unwrap_or_else(|| "batch failed".to_string());
        match bincode::serialize(&payload) {
            Ok(bytes) => {
                if let Err(err) =
                    self.store
                        .failed_jobs
                        .park("distribution_batch", bytes, message, attempts)
                {
                    error!("[DISPATCH] could not park dead batch: {}", err);
                }
                crate::metrics::FAILED_JOBS_TOTAL.inc();
            }
            Err(err) => error!("[DISPATCH] could not encode dead batch: {}", err),
        }
    }

    async fn batch_done(&self, barrier: Arc<CycleBarrier>, outcome: BatchOutcome, dead: bool) {
        barrier.outcome.lock().merge(outcome);
        if dead {
            barrier.dead_batches.fetch_add(1, Ordering::SeqCst);
        }
        if barrier.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.finalize(barrier).await;
        }
    }

    /// Last batch in: settle the cycle from what actually landed.
    async fn finalize(&self, barrier: Arc<CycleBarrier>) {
        let context = &barrier.context;
        let outcome = barrier.outcome.lock().clone();
        let dead_batches = barrier.dead_batches.load(Ordering::SeqCst);

        let report = match settle_cycle(
            self.store.as_ref(),
            self.cache.as_ref(),
            self.config.conservation_tolerance,
            context,
            dead_batches,
        ) {
            Ok((record_written, actual)) => FinalizeReport {
                outcome,
                record_written,
                actual_distributed: actual,
                dead_batches,
            },
            Err(err) => {
                error!(
                    "[DISPATCH] finalize of {} failed: {}",
                    context.period_id, err
                );
                FinalizeReport {
                    outcome,
                    record_written: false,
                    actual_distributed: Money::ZERO,
                    dead_batches,
                }
            }
        };

        if let Some(tx) = barrier.completion.lock().take() {
            let _ = tx.send(report);
        }
    }

}

/// Close out a cycle from what actually landed in the entry tree.
///
/// Shared between the barrier finalize and the synchronous path:
/// recomputes the distributed total, writes the execution record
/// (insert-if-absent), debits the region pool, and invalidates caches.
/// Returns whether this invocation owned the record write, plus the
/// recomputed total.
pub(crate) fn settle_cycle(
    store: &crate::store::Store,
    cache: &DividendCache,
    tolerance: Money,
    context: &CycleContext,
    dead_batches: u64,
) -> Result<(bool, Money)> {
    let actual = store.distributions.total_for_period(&context.period_id)?;
    let (users, merchants) = store.distributions.count_for_period(&context.period_id)?;

    let drift = actual.saturating_sub(context.planned_amount).abs();
    if dead_batches == 0 && drift > tolerance {
        warn!(
            "[DISPATCH] cycle {} distributed {} vs planned {} (drift {})",
            context.period_id, actual, context.planned_amount, drift
        );
        crate::metrics::RECONCILE_MISMATCHES_TOTAL.inc();
    }

    let record = ExecutionRecord {
        id: Uuid::new_v4().to_string(),
        pool_id: context.pool_id,
        cycle_sequence: context.cycle_sequence,
        execute_type: context.execute_type,
        total_amount_at_execution: context.total_amount_at_execution,
        actual_distributed: actual,
        deduct_retained: context.deduct_amount,
        threshold_before: context.threshold_before,
        threshold_after: context.threshold_after,
        growth_rate_applied: context.growth_rate_applied,
        user_count: users,
        merchant_count: merchants,
        executed_at: Utc::now().timestamp(),
    };
    let record_written = match store.executions.append(&record) {
        Ok(()) => true,
        Err(crate::error::EngineError::AlreadyExecuted) => {
            warn!(
                "[DISPATCH] cycle {} already recorded, skipping record write",
                context.period_id
            );
            false
        }
        Err(err) => return Err(err),
    };

    if record_written {
        if let Some(region_id) = &context.region_id {
            // zero-payout cycles still advance the threshold watermark,
            // otherwise a pool with no eligible participants stays due
            // forever
            store
                .pools
                .apply_distribution(region_id, actual, context.threshold_after)?;
            cache.invalidate_region(region_id);
        }
        cache.invalidate_pool(context.pool_id);
        crate::metrics::CYCLES_EXECUTED_TOTAL
            .with_label_values(&[&context.execute_type.to_string()])
            .inc();
        crate::metrics::DISTRIBUTED_CENTS_TOTAL
            .with_label_values(&[&context.execute_type.to_string()])
            .inc_by(actual.cents().max(0) as u64);
        info!(
            "[DISPATCH] cycle {} finalized: {} across {} user(s), {} merchant(s), {} dead batch(es)",
            context.period_id, actual, users, merchants, dead_batches
        );
    }
    store.flush()?;
    Ok((record_written, actual))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{Participant, SledDirectory};
    use crate::ledger::SledLedger;
    use crate::store::{ParticipantKind, Store, WeightBasis};

    fn context(period: &str) -> CycleContext {
        CycleContext {
            period_id: period.to_string(),
            execute_type: ExecuteType::Periodic,
            pool_id: 1,
            region_id: Some("r1".to_string()),
            cycle_sequence: 1,
            total_amount_at_execution: Money::from_major(20_000),
            planned_amount: Money::from_cents(250 * 100),
            deduct_amount: Money::from_major(4_000),
            threshold_before: Money::from_major(10_000),
            threshold_after: Money::from_major(11_500),
            growth_rate_applied: 1500,
            category: "dividend".to_string(),
        }
    }

    fn harness(config: EngineConfig) -> (AsyncDispatcher, Arc<Store>, SledDirectory) {
        let store = Arc::new(Store::open_temporary().unwrap());
        let directory = SledDirectory::open(store.db()).unwrap();
        let ledger = SledLedger::open(store.db()).unwrap();
        let distributor = Arc::new(BonusDistributor::new(
            store.clone(),
            Arc::new(directory.clone()),
            Arc::new(ledger),
        ));
        let cache = Arc::new(DividendCache::new(3600, 3600, 1800));
        let dispatcher = AsyncDispatcher::new(config, distributor, store.clone(), cache);
        (dispatcher, store, directory)
    }

    fn seed_participants(store: &Store, directory: &SledDirectory, count: usize) {
        store
            .pools
            .credit("r1", Money::from_major(20_000))
            .unwrap();
        for i in 0..count {
            directory
                .upsert(&Participant {
                    id: format!("u-{:04}", i),
                    kind: ParticipantKind::User,
                    region_id: "r1".to_string(),
                    tier: 1,
                    integral_score: 10,
                    equity_score: 0,
                    spend_total: Money::from_major(500),
                    active: true,
                })
                .unwrap();
        }
    }

    fn entries(count: usize) -> Vec<PlannedEntry> {
        (0..count)
            .map(|i| PlannedEntry {
                participant_id: format!("u-{:04}", i),
                kind: ParticipantKind::User,
                amount: Money::from_cents(100),
                weight_basis: WeightBasis::Integral,
            })
            .collect()
    }

    #[test]
    fn test_legacy_delay_estimate() {
        // 250 entries at batch size 100: 3 batches, 90s
        assert_eq!(legacy_finalize_delay_secs(250, 100), 90);
        // floor and ceiling
        assert_eq!(legacy_finalize_delay_secs(1, 100), 60);
        assert_eq!(legacy_finalize_delay_secs(100_000, 100), 600);
    }

    #[test]
    fn test_construction_spawns_no_workers() {
        // no runtime here; workers must not start until the first dispatch
        let (dispatcher, _store, _directory) = harness(EngineConfig::default());
        assert!(!dispatcher.workers_started.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fan_out_and_barrier_finalize() {
        let config = EngineConfig {
            retry_delay_ms: 5,
            ..Default::default()
        };
        let (dispatcher, store, directory) = harness(config);
        seed_participants(&store, &directory, 250);

        let receipt = dispatcher
            .dispatch(context("pool-1:periodic:1"), entries(250))
            .await
            .unwrap();
        assert_eq!(receipt.batches, 3);
        assert_eq!(receipt.estimated_finalize_secs, 90);

        let report = receipt.completion.await.unwrap();
        assert!(report.record_written);
        assert_eq!(report.outcome.success, 250);
        assert_eq!(report.dead_batches, 0);
        assert_eq!(report.actual_distributed, Money::from_cents(25_000));

        let record = store
            .executions
            .find(1, ExecuteType::Periodic, 1)
            .unwrap()
            .unwrap();
        assert_eq!(record.user_count, 250);
        assert_eq!(record.actual_distributed, Money::from_cents(25_000));

        let pool = store.pools.get("r1").unwrap().unwrap();
        assert_eq!(pool.distributed_amount, Money::from_cents(25_000));
        assert_eq!(pool.last_threshold_amount, Money::from_major(11_500));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_replayed_cycle_writes_no_second_record() {
        let config = EngineConfig {
            retry_delay_ms: 5,
            ..Default::default()
        };
        let (dispatcher, store, directory) = harness(config);
        seed_participants(&store, &directory, 10);

        let receipt = dispatcher
            .dispatch(context("pool-1:periodic:1"), entries(10))
            .await
            .unwrap();
        let first = receipt.completion.await.unwrap();
        assert!(first.record_written);

        let receipt = dispatcher
            .dispatch(context("pool-1:periodic:1"), entries(10))
            .await
            .unwrap();
        let replay = receipt.completion.await.unwrap();
        assert!(!replay.record_written);
        assert_eq!(replay.outcome.skipped, 10);
        assert_eq!(store.executions.for_pool(1).unwrap().len(), 1);
        // pool debited exactly once
        let pool = store.pools.get("r1").unwrap().unwrap();
        assert_eq!(pool.distributed_amount, Money::from_cents(1_000));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_empty_entry_set_still_finalizes() {
        let config = EngineConfig {
            retry_delay_ms: 5,
            ..Default::default()
        };
        let (dispatcher, store, directory) = harness(config);
        seed_participants(&store, &directory, 0);

        let mut ctx = context("pool-1:periodic:1");
        ctx.planned_amount = Money::ZERO;
        let receipt = dispatcher.dispatch(ctx, Vec::new()).await.unwrap();
        let report = receipt.completion.await.unwrap();
        assert!(report.record_written);
        assert_eq!(report.actual_distributed, Money::ZERO);
        assert!(store
            .executions
            .find(1, ExecuteType::Periodic, 1)
            .unwrap()
            .is_some());
    }
}
