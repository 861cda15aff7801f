//! Background sweep loop.
//!
//! One interval task drives the whole engine: each tick runs the
//! monthly seed when the calendar month has rolled over, then the
//! periodic/growth sweep. `AlreadyRunning` from a competing invocation
//! (another node, or an operator-triggered sweep) is a normal outcome.

use crate::error::EngineError;
use crate::service::DividendEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

pub fn spawn_scheduler(engine: Arc<DividendEngine>, interval_secs: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("[SCHEDULER] sweeping every {}s", interval_secs.max(1));
        loop {
            ticker.tick().await;

            match engine.monthly_due() {
                Ok(true) => match engine.run_monthly().await {
                    Ok(report) => info!(
                        "[SCHEDULER] monthly seed: {} pool(s), {} distributed",
                        report.cycles_executed, report.amount_distributed
                    ),
                    Err(EngineError::AlreadyRunning) => {
                        debug!("[SCHEDULER] monthly seed already running elsewhere")
                    }
                    Err(err) => error!("[SCHEDULER] monthly seed failed: {}", err),
                },
                Ok(false) => {}
                Err(err) => error!("[SCHEDULER] monthly-due check failed: {}", err),
            }

            match engine.sweep().await {
                Ok(report) => {
                    if report.cycles_executed > 0 || report.growth_cycles > 0 {
                        info!(
                            "[SCHEDULER] sweep executed {} cycle(s), {} growth, {}",
                            report.cycles_executed, report.growth_cycles, report.amount_distributed
                        );
                    }
                }
                Err(EngineError::AlreadyRunning) => {
                    debug!("[SCHEDULER] sweep already running elsewhere")
                }
                Err(err) => error!("[SCHEDULER] sweep failed: {}", err),
            }

            match engine.monitor.monitor() {
                Ok(alerts) if !alerts.is_empty() => {
                    info!("[SCHEDULER] {} monitor alert(s) raised", alerts.len())
                }
                Ok(_) => {}
                Err(err) => error!("[SCHEDULER] monitor pass failed: {}", err),
            }
        }
    })
}
