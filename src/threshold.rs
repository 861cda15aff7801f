//! Threshold evaluation.
//!
//! Decides how many payout cycles a pool is due for. The periodic check
//! is a catch-up loop: starting from the pool's last threshold, every
//! time the available balance clears `threshold × (1 + g)` one more
//! cycle is planned and the threshold compounds, so a pool that sat
//! unevaluated for a while settles all overdue cycles in one pass.

use crate::config::EngineConfig;
use crate::money::Money;
use crate::store::Pool;
use tracing::debug;

/// One planned payout cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CyclePlan {
    pub sequence: u64,
    pub threshold_before: Money,
    pub threshold_after: Money,
    /// Incremental amount this cycle pays from: after − before.
    pub payout_base: Money,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub due: bool,
    pub cycles: Vec<CyclePlan>,
}

/// Platform growth dividend trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrowthTrigger {
    pub threshold_before: Money,
    pub threshold_after: Money,
}

pub struct ThresholdEngine {
    config: EngineConfig,
}

impl ThresholdEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Plan the periodic cycles a pool is due for. `next_sequence` is the
    /// cycle number the first planned cycle would get.
    pub fn evaluate(&self, pool: &Pool, next_sequence: u64) -> Evaluation {
        let growth = self.config.growth_rate_bps;
        let mut cursor = if pool.last_threshold_amount.is_positive() {
            pool.last_threshold_amount
        } else {
            pool.initial_threshold
        };
        let mut cycles = Vec::new();
        let mut sequence = next_sequence;

        while cursor.is_positive() {
            let trigger = cursor.grow_bps(growth);
            if pool.available_amount < trigger {
                break;
            }
            cycles.push(CyclePlan {
                sequence,
                threshold_before: cursor,
                threshold_after: trigger,
                payout_base: trigger.saturating_sub(cursor),
            });
            cursor = trigger;
            sequence += 1;
        }

        if !cycles.is_empty() {
            debug!(
                "[THRESHOLD] pool {} due for {} cycle(s), available={} threshold {} -> {}",
                pool.id,
                cycles.len(),
                pool.available_amount,
                cycles[0].threshold_before,
                cursor
            );
        }
        Evaluation {
            due: !cycles.is_empty(),
            cycles,
        }
    }

    /// Platform-wide growth check: paid volume against the single global
    /// threshold. At most one trigger per evaluation, no catch-up loop.
    pub fn evaluate_growth(&self, volume: Money, last_threshold: Money) -> Option<GrowthTrigger> {
        if !last_threshold.is_positive() {
            if volume >= self.config.growth_initial_threshold {
                return Some(GrowthTrigger {
                    threshold_before: Money::ZERO,
                    threshold_after: volume,
                });
            }
            return None;
        }
        let trigger = last_threshold.grow_bps(self.config.growth_rate_bps);
        if volume >= trigger {
            Some(GrowthTrigger {
                threshold_before: last_threshold,
                threshold_after: volume,
            })
        } else {
            None
        }
    }
}
