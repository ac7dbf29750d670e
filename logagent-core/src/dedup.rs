//! Deduplication cache: a time-bounded set of fingerprints
//! keyed by `(source_id, offset, payload)`. Backed by an in-process
//! sharded `DashMap` rather than a Redis-backed cache, since the dedup
//! window only needs to survive process uptime, not restarts.

use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::record::FingerprintKey;

/// 64-bit fingerprint derived from a [`FingerprintKey`]. Collisions are
/// accepted (duplicate-suppression is best-effort, not a correctness
/// boundary) in exchange for O(1) entries instead of storing full keys.
pub fn fingerprint(key: &FingerprintKey) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// Time-bounded fingerprint set. Insertion and lookup are atomic per-entry via
/// `DashMap`'s sharded locking, satisfying the "fingerprint insertion and
/// dedup check are atomic" ordering guarantee.
#[derive(Debug)]
pub struct DedupCache {
    entries: DashMap<u64, Instant>,
    ttl: Duration,
}

impl DedupCache {
    pub fn new(ttl: Duration) -> Self {
        DedupCache {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Returns `true` if `key` was already present (and therefore this
    /// record should be dropped as a duplicate); otherwise inserts it and
    /// returns `false`. A key inserted just under the TTL is still
    /// deduplicated; once the TTL has elapsed it is admitted again.
    pub fn check_and_insert(&self, key: &FingerprintKey) -> bool {
        let fp = fingerprint(key);
        let now = Instant::now();
        if let Some(mut existing) = self.entries.get_mut(&fp) {
            if now.duration_since(*existing) < self.ttl {
                return true;
            }
            *existing = now;
            return false;
        }
        self.entries.insert(fp, now);
        false
    }

    /// Sweeps expired entries; intended to be called from a periodic
    /// background tick rather than on every insert, so the dedup hot path
    /// never pays for a full-table scan.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries.retain(|_, inserted_at| now.duration_since(*inserted_at) < ttl);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Cursor;

    fn key(offset: u64) -> FingerprintKey {
        FingerprintKey {
            source_id: "a.log".into(),
            cursor: Cursor::File { inode: 1, byte_offset: offset },
            payload_len: 5,
            payload: "hello".into(),
        }
    }

    #[test]
    fn second_insert_of_same_key_is_duplicate() {
        let cache = DedupCache::new(Duration::from_secs(300));
        assert!(!cache.check_and_insert(&key(0)));
        assert!(cache.check_and_insert(&key(0)));
    }

    #[test]
    fn distinct_offsets_are_not_duplicates() {
        let cache = DedupCache::new(Duration::from_secs(300));
        assert!(!cache.check_and_insert(&key(0)));
        assert!(!cache.check_and_insert(&key(5)));
    }

    #[test]
    fn expired_entry_is_admitted_again() {
        let cache = DedupCache::new(Duration::from_millis(10));
        assert!(!cache.check_and_insert(&key(0)));
        std::thread::sleep(Duration::from_millis(30));
        assert!(!cache.check_and_insert(&key(0)));
    }
}
