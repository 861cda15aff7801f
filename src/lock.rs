//! Distributed execution lock.
//!
//! A compare-and-swap record in sled with an owner token and a TTL.
//! Acquisition is non-blocking: a held lock means some invocation is
//! already sweeping and the caller should report `AlreadyRunning` and
//! back off. Releases only succeed with the owner token, so a slow
//! holder cannot be unlocked by a later acquirer; an expired record is
//! stealable.

use crate::error::Result;
use crate::store::{decode, encode};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

/// All distribution runs serialize behind this one name.
pub const GLOBAL_LOCK: &str = "dividend:global";

const TREE_LOCKS: &str = "locks";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockRecord {
    owner_token: String,
    expires_at: i64,
}

#[derive(Clone)]
pub struct DistributedLock {
    tree: sled::Tree,
    ttl_secs: u64,
}

impl DistributedLock {
    pub fn open(db: &sled::Db, ttl_secs: u64) -> Result<Self> {
        Ok(Self {
            tree: db.open_tree(TREE_LOCKS)?,
            ttl_secs,
        })
    }

    /// Try to take the named lock. `None` means somebody else holds it.
    pub fn acquire(&self, name: &str) -> Result<Option<LockGuard>> {
        let token = Uuid::new_v4().to_string();
        let record = LockRecord {
            owner_token: token.clone(),
            expires_at: Utc::now().timestamp() + self.ttl_secs as i64,
        };
        let encoded = encode(&record)?;

        let current = self.tree.get(name.as_bytes())?;
        let expected: Option<&[u8]> = match &current {
            None => None,
            Some(bytes) => {
                let held: LockRecord = decode(bytes)?;
                if held.expires_at > Utc::now().timestamp() {
                    debug!("[LOCK] {} held by {}, not acquiring", name, held.owner_token);
                    return Ok(None);
                }
                warn!(
                    "[LOCK] {} expired (owner {}), taking over",
                    name, held.owner_token
                );
                Some(bytes.as_ref())
            }
        };

        let swapped = self
            .tree
            .compare_and_swap(name.as_bytes(), expected, Some(encoded))?;
        if swapped.is_err() {
            // lost the race to another acquirer
            return Ok(None);
        }
        debug!("[LOCK] {} acquired by {}", name, token);
        Ok(Some(LockGuard {
            tree: self.tree.clone(),
            name: name.to_string(),
            token,
            released: false,
        }))
    }
}

pub struct LockGuard {
    tree: sled::Tree,
    name: String,
    token: String,
    released: bool,
}

impl LockGuard {
    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        if let Some(bytes) = self.tree.get(self.name.as_bytes())? {
            let held: LockRecord = decode(&bytes)?;
            if held.owner_token == self.token {
                let _ = self.tree.compare_and_swap(
                    self.name.as_bytes(),
                    Some(bytes.as_ref()),
                    None as Option<&[u8]>,
                )?;
                debug!("[LOCK] {} released by {}", self.name, self.token);
            }
        }
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            if let Err(err) = self.release_inner() {
                warn!("[LOCK] release of {} failed on drop: {}", self.name, err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock(ttl: u64) -> DistributedLock {
        let db = sled::Config::new().temporary(true).open().unwrap();
        DistributedLock::open(&db, ttl).unwrap()
    }

    #[test]
    fn test_second_acquire_is_refused() {
        let lock = lock(300);
        let guard = lock.acquire(GLOBAL_LOCK).unwrap();
        assert!(guard.is_some());
        assert!(lock.acquire(GLOBAL_LOCK).unwrap().is_none());
        guard.unwrap().release().unwrap();
        assert!(lock.acquire(GLOBAL_LOCK).unwrap().is_some());
    }

    #[test]
    fn test_drop_releases() {
        let lock = lock(300);
        {
            let _guard = lock.acquire(GLOBAL_LOCK).unwrap().unwrap();
            assert!(lock.acquire(GLOBAL_LOCK).unwrap().is_none());
        }
        assert!(lock.acquire(GLOBAL_LOCK).unwrap().is_some());
    }

    #[test]
    fn test_expired_lock_is_stealable() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let stale = DistributedLock::open(&db, 0).unwrap();
        let fresh = DistributedLock::open(&db, 300).unwrap();
        // ttl 0 means the stale record is immediately past its expiry
        let first = stale.acquire(GLOBAL_LOCK).unwrap().unwrap();
        let second = fresh.acquire(GLOBAL_LOCK).unwrap();
        assert!(second.is_some());
        // the evicted holder's release must not clobber the new owner
        first.release().unwrap();
        assert!(fresh.acquire(GLOBAL_LOCK).unwrap().is_none());
    }

    #[test]
    fn test_independent_names_do_not_contend() {
        let lock = lock(300);
        let a = lock.acquire("a").unwrap();
        let b = lock.acquire("b").unwrap();
        assert!(a.is_some() && b.is_some());
    }
}
