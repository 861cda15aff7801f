//! Prometheus collectors.
//!
//! One process-wide registry; collectors register themselves on first
//! touch. Rendered by the `/metrics` admin route.

use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub static PROM_REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static POOL_CREDITS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("dividend_pool_credits_total", "Pool credits applied").unwrap();
    PROM_REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static CYCLES_EXECUTED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("dividend_cycles_executed_total", "Payout cycles executed"),
        &["kind"],
    )
    .unwrap();
    PROM_REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static DISTRIBUTED_CENTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "dividend_distributed_cents_total",
            "Amount distributed, in cents",
        ),
        &["kind"],
    )
    .unwrap();
    PROM_REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static ENTRIES_APPLIED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "dividend_entries_applied_total",
        "Distribution entries credited",
    )
    .unwrap();
    PROM_REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static ENTRIES_SKIPPED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "dividend_entries_skipped_total",
        "Distribution entries skipped (inactive or duplicate)",
    )
    .unwrap();
    PROM_REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static ENTRIES_FAILED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "dividend_entries_failed_total",
        "Distribution entries that failed to credit",
    )
    .unwrap();
    PROM_REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static QUEUE_DEPTH: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("dividend_queue_depth", "Batch jobs waiting or running").unwrap();
    PROM_REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static FAILED_JOBS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("dividend_failed_jobs_total", "Batch jobs parked after retries")
        .unwrap();
    PROM_REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static RECONCILE_MISMATCHES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "dividend_reconcile_mismatches_total",
        "Reconciliation discrepancies found",
    )
    .unwrap();
    PROM_REGISTRY.register(Box::new(c.clone())).ok();
    c
});

/// Render the registry in the text exposition format.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&PROM_REGISTRY.gather(), &mut buffer).ok();
    String::from_utf8_lossy(&buffer).into_owned()
}
