//! Threshold-triggered bonus distribution engine.
//!
//! Accumulates a share of transaction handling fees into per-region
//! reward pools and pays them out whenever a pool crosses a
//! geometrically growing threshold, alongside a monthly seed
//! distribution and a platform-wide per-order growth dividend. All
//! money math is integer cents; every payout cycle is idempotent and
//! reconcilable.

pub mod accumulator;
pub mod cache;
pub mod calculator;
pub mod config;
pub mod directory;
pub mod dispatch;
pub mod distributor;
pub mod error;
pub mod ledger;
pub mod lock;
pub mod metrics;
pub mod money;
pub mod monitor;
pub mod routes;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod threshold;

pub use accumulator::{AuditStatus, PaidFeeEvent, PoolAccumulator};
pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use money::Money;
pub use service::{DividendEngine, SweepReport};
