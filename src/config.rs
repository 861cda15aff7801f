//! Engine configuration.
//!
//! One immutable value built at startup and handed to every component at
//! construction. Defaults mirror the production ratios; every knob can be
//! overridden through a `DIVIDEND_*` environment variable.

use crate::money::Money;
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Fraction of each handling fee credited to the region pool (bps).
    pub fee_share_bps: u32,

    /// Geometric threshold growth per cycle (bps above 1.0).
    pub growth_rate_bps: u32,

    /// Share of the due amount actually paid out; the rest is retained
    /// and folded into the next threshold baseline (bps).
    pub payout_share_bps: u32,

    /// Periodic-cycle split: equal share for tiered team members (bps).
    pub team_share_bps: u32,

    /// Periodic-cycle split: integral-weighted share (bps).
    pub integral_share_bps: u32,

    /// Monthly seed split between users and merchants (bps each).
    pub user_share_bps: u32,
    pub merchant_share_bps: u32,

    /// Monthly seed: pools at or above this keep a reserve untouched.
    pub monthly_high_water: Money,
    pub monthly_reserve: Money,

    /// Entries below this are dropped from a split, not reassigned.
    pub min_payout: Money,

    /// Allowed drift between computed and recorded totals.
    pub conservation_tolerance: Money,

    /// Minimum lifetime spend for split eligibility.
    pub min_spend_eligibility: Money,

    /// Team-round variant: per-round share of the base figure (bps) and
    /// the maximum number of rounds.
    pub team_round_share_bps: u32,
    pub max_team_rounds: u32,

    /// Growth dividend: platform volume must first reach this.
    pub growth_initial_threshold: Money,

    /// Growth dividend: first-cycle payout as a fraction of the order's
    /// own handling fee (bps).
    pub growth_first_cycle_bps: u32,

    /// Growth dividend: hard cap on payout cycles per order.
    pub max_growth_cycles: u32,

    /// Async fan-out.
    pub batch_size: usize,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub worker_count: usize,

    /// Participant sets at or above this size go through the async
    /// dispatcher instead of the synchronous path.
    pub async_threshold: usize,

    /// Distributed lock TTL (seconds).
    pub lock_ttl_secs: u64,

    /// Cache TTLs (seconds).
    pub participants_ttl_secs: u64,
    pub last_record_ttl_secs: u64,
    pub aggregates_ttl_secs: u64,

    /// Scheduler sweep interval (seconds).
    pub sweep_interval_secs: u64,

    /// Monitor thresholds.
    pub monitor: MonitorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// A cycle slower than this raises a latency alert (seconds).
    pub max_processing_secs: u64,

    /// Alert when the entry success rate drops below this (bps).
    pub min_success_rate_bps: u32,

    /// Alert when parked failed jobs exceed this.
    pub failed_job_backlog_limit: u64,

    /// Alert when the average payout per entry exceeds this.
    pub avg_payout_alert: Money,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_processing_secs: 3600,
            min_success_rate_bps: 9500,
            failed_job_backlog_limit: 10,
            avg_payout_alert: Money::from_major(10_000),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fee_share_bps: 4000,
            growth_rate_bps: 1500,
            payout_share_bps: 6000,
            team_share_bps: 3000,
            integral_share_bps: 7000,
            user_share_bps: 5000,
            merchant_share_bps: 5000,
            monthly_high_water: Money::from_major(40_000),
            monthly_reserve: Money::from_major(20_000),
            min_payout: Money::from_cents(1),
            conservation_tolerance: Money::from_cents(2),
            min_spend_eligibility: Money::from_major(100),
            team_round_share_bps: 500,
            max_team_rounds: 4,
            growth_initial_threshold: Money::from_major(1_000),
            growth_first_cycle_bps: 2500,
            max_growth_cycles: 36,
            batch_size: 100,
            max_retries: 3,
            retry_delay_ms: 60_000,
            worker_count: 4,
            async_threshold: 200,
            lock_ttl_secs: 300,
            participants_ttl_secs: 3600,
            last_record_ttl_secs: 3600,
            aggregates_ttl_secs: 1800,
            sweep_interval_secs: 300,
            monitor: MonitorConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables on top of defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        read_bps("DIVIDEND_FEE_SHARE_BPS", &mut config.fee_share_bps);
        read_bps("DIVIDEND_GROWTH_RATE_BPS", &mut config.growth_rate_bps);
        read_bps("DIVIDEND_PAYOUT_SHARE_BPS", &mut config.payout_share_bps);
        read_bps("DIVIDEND_TEAM_SHARE_BPS", &mut config.team_share_bps);
        read_bps("DIVIDEND_INTEGRAL_SHARE_BPS", &mut config.integral_share_bps);
        read_money("DIVIDEND_MONTHLY_HIGH_WATER", &mut config.monthly_high_water);
        read_money("DIVIDEND_MONTHLY_RESERVE", &mut config.monthly_reserve);
        read_money(
            "DIVIDEND_GROWTH_INITIAL_THRESHOLD",
            &mut config.growth_initial_threshold,
        );
        read_num("DIVIDEND_MAX_GROWTH_CYCLES", &mut config.max_growth_cycles);
        read_num("DIVIDEND_BATCH_SIZE", &mut config.batch_size);
        read_num("DIVIDEND_MAX_RETRIES", &mut config.max_retries);
        read_num("DIVIDEND_RETRY_DELAY_MS", &mut config.retry_delay_ms);
        read_num("DIVIDEND_WORKER_COUNT", &mut config.worker_count);
        read_num("DIVIDEND_ASYNC_THRESHOLD", &mut config.async_threshold);
        read_num("DIVIDEND_LOCK_TTL_SECS", &mut config.lock_ttl_secs);
        read_num(
            "DIVIDEND_SWEEP_INTERVAL_SECS",
            &mut config.sweep_interval_secs,
        );
        read_num(
            "DIVIDEND_PARTICIPANTS_TTL_SECS",
            &mut config.participants_ttl_secs,
        );

        config
    }

    /// Share of a periodic payout retained for the next threshold (bps).
    pub fn deduct_share_bps(&self) -> u32 {
        10_000u32.saturating_sub(self.payout_share_bps)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.payout_share_bps > 10_000 {
            return Err("payout share cannot exceed 10000 bps".to_string());
        }
        if self.team_share_bps + self.integral_share_bps != 10_000 {
            return Err("team + integral shares must total 10000 bps".to_string());
        }
        if self.user_share_bps + self.merchant_share_bps != 10_000 {
            return Err("user + merchant shares must total 10000 bps".to_string());
        }
        if self.batch_size == 0 || self.worker_count == 0 {
            return Err("batch size and worker count must be positive".to_string());
        }
        Ok(())
    }
}

fn read_bps(key: &str, slot: &mut u32) {
    if let Ok(val) = env::var(key) {
        if let Ok(num) = val.trim().parse::<u32>() {
            *slot = num;
        }
    }
}

fn read_money(key: &str, slot: &mut Money) {
    if let Ok(val) = env::var(key) {
        if let Ok(amount) = val.trim().parse::<Money>() {
            *slot = amount;
        }
    }
}

fn read_num<T: std::str::FromStr>(key: &str, slot: &mut T) {
    if let Ok(val) = env::var(key) {
        if let Ok(num) = val.trim().parse::<T>() {
            *slot = num;
        }
    }
}
