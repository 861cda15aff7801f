//! Memo caches with TTL and explicit invalidation.
//!
//! TTL expiry alone is not trusted for eligibility data: any mutation
//! that changes who gets paid (pool update, tier change, participant
//! seeding) must invalidate the affected keys eagerly.

use crate::directory::Participant;
use crate::error::Result;
use crate::money::Money;
use crate::store::ExecutionRecord;
use dashmap::DashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

pub struct TtlCache<K, V> {
    entries: DashMap<K, (Instant, V)>,
    ttl: Duration,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let entry = self.entries.get(key)?;
        let (stored_at, value) = entry.value();
        if stored_at.elapsed() > self.ttl {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(value.clone())
    }

    pub fn get_or_compute<F>(&self, key: K, compute: F) -> Result<V>
    where
        F: FnOnce() -> Result<V>,
    {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }
        let value = compute()?;
        self.entries.insert(key, (Instant::now(), value.clone()));
        Ok(value)
    }

    pub fn invalidate(&self, key: &K) {
        self.entries.remove(key);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The engine's cache set: participant snapshots per region, last
/// execution record per pool, small money aggregates.
pub struct DividendCache {
    pub participants: TtlCache<String, Vec<Participant>>,
    pub last_record: TtlCache<u64, Option<ExecutionRecord>>,
    pub aggregates: TtlCache<String, Money>,
}

impl DividendCache {
    pub fn new(participants_ttl: u64, last_record_ttl: u64, aggregates_ttl: u64) -> Self {
        Self {
            participants: TtlCache::new(Duration::from_secs(participants_ttl)),
            last_record: TtlCache::new(Duration::from_secs(last_record_ttl)),
            aggregates: TtlCache::new(Duration::from_secs(aggregates_ttl)),
        }
    }

    pub fn invalidate_region(&self, region_id: &str) {
        self.participants.invalidate(&region_id.to_string());
    }

    pub fn invalidate_pool(&self, pool_id: u64) {
        self.last_record.invalidate(&pool_id);
        // aggregates key on composite strings; cheap to drop wholesale
        self.aggregates.clear();
    }
}
