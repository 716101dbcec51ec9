//! Scan-lifetime store of the best known record per object.
use crate::alert::AlertRecord;

use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertStats {
    pub inserted: usize,
    pub replaced: usize,
    pub unchanged: usize,
    pub malformed: usize,
}

impl UpsertStats {
    pub fn absorb(&mut self, other: UpsertStats) {
        self.inserted += other.inserted;
        self.replaced += other.replaced;
        self.unchanged += other.unchanged;
        self.malformed += other.malformed;
    }
}

/// Object id to record, updated by recency only.
///
/// A record replaces the cached one only when its current detection is
/// strictly more recent, so upserting the same batch twice, or batches in
/// any order, converges to the same contents. There is no eviction.
#[derive(Debug, Clone, Default)]
pub struct CandidateCache {
    entries: BTreeMap<String, AlertRecord>,
}

impl CandidateCache {
    pub fn new() -> Self {
        CandidateCache::default()
    }

    pub fn upsert(&mut self, records: impl IntoIterator<Item = AlertRecord>) -> UpsertStats {
        let mut stats = UpsertStats::default();
        for record in records {
            let jd = match record.jd() {
                Ok(jd) => jd,
                Err(error) => {
                    warn!(error.message = %error, "not caching malformed alert");
                    stats.malformed += 1;
                    continue;
                }
            };
            match self.entries.get(&record.object_id) {
                None => {
                    debug!(object_id = %record.object_id, jd, "new candidate");
                    self.entries.insert(record.object_id.clone(), record);
                    stats.inserted += 1;
                }
                // a cached entry always has a valid jd
                Some(cached) if cached.candidate.jd.is_some_and(|cached_jd| jd > cached_jd) => {
                    debug!(object_id = %record.object_id, jd, "newer detection replaces cached one");
                    self.entries.insert(record.object_id.clone(), record);
                    stats.replaced += 1;
                }
                Some(_) => stats.unchanged += 1,
            }
        }
        stats
    }

    /// Every cached record, ordered by object id.
    pub fn snapshot(&self) -> &BTreeMap<String, AlertRecord> {
        &self.entries
    }

    pub fn get(&self, object_id: &str) -> Option<&AlertRecord> {
        self.entries.get(object_id)
    }

    pub fn contains(&self, object_id: &str) -> bool {
        self.entries.contains_key(object_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
