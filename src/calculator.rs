//! Bonus calculation. Pure money math, no I/O.
//!
//! All formulas run on integer cents with bc-style truncation (see
//! `money`). The proportional split assigns the exact residual to the
//! last participant in iteration order, so the distributed sum always
//! equals the target to the cent.

use crate::config::EngineConfig;
use crate::money::Money;

/// Result of the periodic threshold check for one pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodicBonus {
    pub should_distribute: bool,
    /// Amount above the previous threshold baseline.
    pub should_amount: Money,
    /// 60% of `should_amount`, actually paid out.
    pub actual_amount: Money,
    /// The retained 40%, folded into the next baseline.
    pub deduct_amount: Money,
    /// Baseline for the next cycle: total + retained.
    pub next_threshold: Money,
}

/// Distributes iff `total ≥ last_threshold × (1 + growth_rate)`.
pub fn periodic_bonus(total: Money, last_threshold: Money, growth_rate_bps: u32) -> PeriodicBonus {
    let trigger = last_threshold.grow_bps(growth_rate_bps);
    if total < trigger || !total.is_positive() {
        return PeriodicBonus {
            should_distribute: false,
            should_amount: Money::ZERO,
            actual_amount: Money::ZERO,
            deduct_amount: Money::ZERO,
            next_threshold: last_threshold,
        };
    }
    let should_amount = total.saturating_sub(last_threshold);
    let actual_amount = should_amount.mul_bps(6000);
    let deduct_amount = should_amount.saturating_sub(actual_amount);
    let next_threshold = total.saturating_add(deduct_amount);
    PeriodicBonus {
        should_distribute: true,
        should_amount,
        actual_amount,
        deduct_amount,
        next_threshold,
    }
}

/// Monthly seed distribution amounts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonthlySeed {
    pub should_distribute: bool,
    /// Amount eligible for the 60/40 split after the reserve.
    pub distributable: Money,
    pub distribute_amount: Money,
    pub remain_amount: Money,
}

/// Pools at the high-water mark keep a fixed reserve; the rest (or the
/// whole balance below the mark) splits 60/40.
pub fn monthly_seed(available: Money, config: &EngineConfig) -> MonthlySeed {
    if available <= Money::from_major(1) {
        return MonthlySeed {
            should_distribute: false,
            distributable: Money::ZERO,
            distribute_amount: Money::ZERO,
            remain_amount: Money::ZERO,
        };
    }
    let distributable = if available >= config.monthly_high_water {
        available.saturating_sub(config.monthly_reserve)
    } else {
        available
    };
    let distribute_amount = distributable.mul_bps(config.payout_share_bps);
    MonthlySeed {
        should_distribute: true,
        distributable,
        distribute_amount,
        remain_amount: distributable.saturating_sub(distribute_amount),
    }
}

/// Proportional split with residual assignment.
///
/// Every participant but the last gets `total × w_i / Σw` (ratio
/// truncated at 6 decimals, product truncated to cents); the last gets
/// exactly what is left, forcing conservation. Shares below
/// `min_payout` are dropped, not reassigned.
pub fn proportional_split<T, F>(
    participants: &[T],
    total: Money,
    min_payout: Money,
    weight_of: F,
) -> Vec<(usize, Money)>
where
    F: Fn(&T) -> u128,
{
    if participants.is_empty() || !total.is_positive() {
        return Vec::new();
    }
    let total_weight: u128 = participants.iter().map(&weight_of).sum();
    if total_weight == 0 {
        return Vec::new();
    }

    let mut amounts = Vec::with_capacity(participants.len());
    let mut allocated = Money::ZERO;
    let last = participants.len() - 1;
    for (index, participant) in participants.iter().enumerate() {
        let amount = if index == last {
            total.saturating_sub(allocated)
        } else {
            let share = total.share(weight_of(participant), total_weight);
            allocated = allocated.saturating_add(share);
            share
        };
        if amount >= min_payout {
            amounts.push((index, amount));
        }
    }
    amounts
}

/// One equal-split round over a tier bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeamRound {
    pub round: u32,
    pub eligible: Vec<usize>,
    pub round_pool: Money,
    pub per_member: Money,
}

/// Tiered team rounds: round r draws a fixed percent of `base` and
/// splits it equally among participants with tier ≥ r. Rounds stop when
/// a bucket comes up empty or `max_team_rounds` is reached.
pub fn tiered_team_rounds<T, F>(
    participants: &[T],
    base: Money,
    config: &EngineConfig,
    tier_of: F,
) -> Vec<TeamRound>
where
    F: Fn(&T) -> u8,
{
    let mut rounds = Vec::new();
    for round in 1..=config.max_team_rounds {
        let eligible: Vec<usize> = participants
            .iter()
            .enumerate()
            .filter(|(_, p)| u32::from(tier_of(p)) >= round)
            .map(|(i, _)| i)
            .collect();
        if eligible.is_empty() {
            break;
        }
        let round_pool = base.mul_bps(config.team_round_share_bps);
        let per_member = round_pool.split_equal(eligible.len());
        rounds.push(TeamRound {
            round,
            eligible,
            round_pool,
            per_member,
        });
    }
    rounds
}

/// `|Σ amounts − expected| ≤ tolerance`.
pub fn validate_conservation(amounts: &[Money], expected: Money, tolerance: Money) -> bool {
    let total: Money = amounts.iter().copied().sum();
    total.saturating_sub(expected).abs() <= tolerance
}

/// Growth dividend payout for an order's next cycle.
///
/// Cycle 1 pays a fixed fraction of the order's own handling fee; each
/// later cycle scales the previous payout by the growth rate. Returns
/// `None` once the order has exhausted its cycle cap.
pub fn growth_payout(
    handling_fee: Money,
    cycles_paid: u32,
    last_payout: Money,
    config: &EngineConfig,
) -> Option<Money> {
    if cycles_paid >= config.max_growth_cycles {
        return None;
    }
    let payout = if cycles_paid == 0 {
        handling_fee.mul_bps(config.growth_first_cycle_bps)
    } else {
        last_payout.grow_bps(config.growth_rate_bps)
    };
    Some(payout)
}
