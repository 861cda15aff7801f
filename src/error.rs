//! Engine error types.
//!
//! Every distinguishable outcome gets its own variant so callers
//! and the execution log can tell skips, conflicts and real failures
//! apart. `AlreadyRunning` and `AlreadyExecuted` are idempotent no-ops,
//! not failures.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed input or an inactive participant; the item is skipped
    /// and the batch continues.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The global cycle lock is held by another scheduler instance.
    #[error("cycle already running")]
    AlreadyRunning,

    /// An ExecutionRecord for this pool/cycle already exists.
    #[error("cycle already executed")]
    AlreadyExecuted,

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// A transactional write failed; only the failing entry rolls back.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// An async batch failed all its attempts and was parked.
    #[error("retries exhausted after {attempts} attempts: {message}")]
    ExhaustedRetry { attempts: u32, message: String },
}

impl EngineError {
    /// True for outcomes that mean "someone else already did (or is
    /// doing) this work" rather than an actual fault.
    pub fn is_idempotent_noop(&self) -> bool {
        matches!(
            self,
            EngineError::AlreadyRunning | EngineError::AlreadyExecuted
        )
    }
}

impl From<sled::transaction::TransactionError<EngineError>> for EngineError {
    fn from(err: sled::transaction::TransactionError<EngineError>) -> Self {
        match err {
            sled::transaction::TransactionError::Abort(e) => e,
            sled::transaction::TransactionError::Storage(e) => EngineError::Storage(e),
        }
    }
}
