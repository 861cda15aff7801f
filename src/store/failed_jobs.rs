//! Parked failed jobs.
//!
//! A batch that exhausts its retries lands here with its payload intact
//! so an operator (or a scheduled retry) can replay it. Rows are never
//! auto-deleted; a successful replay marks them resolved.

use crate::error::Result;
use crate::store::{decode, encode};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedJob {
    pub id: u64,
    pub job_type: String,
    pub payload: Vec<u8>,
    pub error_message: String,
    pub retry_count: u32,
    pub resolved: bool,
    pub created_at: i64,
}

#[derive(Clone)]
pub struct FailedJobStore {
    tree: sled::Tree,
    db: sled::Db,
}

impl FailedJobStore {
    pub fn new(tree: sled::Tree, db: sled::Db) -> Self {
        Self { tree, db }
    }

    pub fn park(
        &self,
        job_type: &str,
        payload: Vec<u8>,
        error_message: String,
        retry_count: u32,
    ) -> Result<FailedJob> {
        let job = FailedJob {
            id: self.db.generate_id()?,
            job_type: job_type.to_string(),
            payload,
            error_message,
            retry_count,
            resolved: false,
            created_at: Utc::now().timestamp(),
        };
        self.tree.insert(job.id.to_be_bytes(), encode(&job)?)?;
        warn!(
            "[FAILED_JOBS] parked job id={} type={} after {} attempts: {}",
            job.id, job.job_type, job.retry_count, job.error_message
        );
        Ok(job)
    }

    pub fn get(&self, id: u64) -> Result<Option<FailedJob>> {
        match self.tree.get(id.to_be_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn mark_resolved(&self, id: u64) -> Result<()> {
        if let Some(bytes) = self.tree.get(id.to_be_bytes())? {
            let mut job: FailedJob = decode(&bytes)?;
            job.resolved = true;
            self.tree.insert(id.to_be_bytes(), encode(&job)?)?;
        }
        Ok(())
    }

    pub fn pending(&self) -> Result<Vec<FailedJob>> {
        let mut jobs = Vec::new();
        for item in self.tree.iter() {
            let (_, value) = item?;
            let job: FailedJob = decode(&value)?;
            if !job.resolved {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    /// Unresolved jobs parked in the last `window_secs`, for backlog alerts.
    pub fn pending_since(&self, window_secs: i64) -> Result<u64> {
        let cutoff = Utc::now().timestamp() - window_secs;
        let mut count = 0;
        for job in self.pending()? {
            if job.created_at >= cutoff {
                count += 1;
            }
        }
        Ok(count)
    }
}
