//! Mapping cache: fingerprint → latest accepted mapping.
//!
//! Entries are immutable `Arc<FieldMapping>` values, so a reader either sees
//! the previous mapping or the new one, never a partial write. Reads share a
//! read lock and stamp an atomic recency tick; only store/invalidate/reset
//! take the write lock.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Result, SutureError};
use crate::mapping::FieldMapping;
use crate::schema::SchemaFingerprint;

struct CacheEntry {
    mapping: Arc<FieldMapping>,
    last_used: AtomicU64,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<SchemaFingerprint, CacheEntry>,
    /// Last version handed out per fingerprint; survives invalidation and
    /// eviction until the fingerprint ages out of `retired`
    versions: HashMap<SchemaFingerprint, u64>,
    /// Fingerprints removed from `entries`, oldest first, at most `capacity`
    retired: VecDeque<SchemaFingerprint>,
}

impl CacheInner {
    fn retire(&mut self, fingerprint: SchemaFingerprint, capacity: usize) {
        self.retired.push_back(fingerprint);
        while self.retired.len() > capacity {
            if let Some(old) = self.retired.pop_front() {
                // still cached, or retired again later
                if !self.entries.contains_key(&old) && !self.retired.contains(&old) {
                    self.versions.remove(&old);
                }
            }
        }
    }
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// LRU-bounded mapping cache.
pub struct MappingCache {
    inner: RwLock<CacheInner>,
    capacity: usize,
    tick: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl MappingCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(CacheInner::default()),
            capacity: capacity.max(1),
            tick: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    #[inline]
    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Look up the mapping for `fingerprint`.
    ///
    /// An entry whose mapping was built for a different fingerprint is
    /// evicted and reported as `FingerprintMismatch`; callers fall back to
    /// fresh inference.
    pub fn lookup(&self, fingerprint: SchemaFingerprint) -> Result<Option<Arc<FieldMapping>>> {
        let mismatch = {
            let guard = self.inner.read();
            match guard.entries.get(&fingerprint) {
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return Ok(None);
                }
                Some(entry) if entry.mapping.fingerprint == fingerprint => {
                    entry.last_used.store(self.next_tick(), Ordering::Relaxed);
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Some(Arc::clone(&entry.mapping)));
                }
                Some(entry) => entry.mapping.fingerprint,
            }
        };

        warn!(key = %fingerprint, stored = %mismatch, "Evicting cache entry with mismatched fingerprint");
        self.invalidate(fingerprint);
        self.misses.fetch_add(1, Ordering::Relaxed);
        Err(SutureError::FingerprintMismatch {
            cached: mismatch,
            observed: fingerprint,
        })
    }

    /// Read an entry without touching recency or hit counters.
    pub fn peek(&self, fingerprint: SchemaFingerprint) -> Option<Arc<FieldMapping>> {
        self.inner
            .read()
            .entries
            .get(&fingerprint)
            .filter(|e| e.mapping.fingerprint == fingerprint)
            .map(|e| Arc::clone(&e.mapping))
    }

    /// Store `mapping` under `fingerprint`, replacing any prior entry.
    ///
    /// Assigns the next per-fingerprint version and returns the stored mapping.
    /// Version history is kept for cached fingerprints plus the last
    /// `capacity` removed ones; older fingerprints restart at 1.
    pub fn store(&self, fingerprint: SchemaFingerprint, mut mapping: FieldMapping) -> Arc<FieldMapping> {
        let mut guard = self.inner.write();

        let version = guard.versions.entry(fingerprint).or_insert(0);
        *version += 1;
        mapping.version = *version;
        let mapping = Arc::new(mapping);

        if !guard.entries.contains_key(&fingerprint) && guard.entries.len() >= self.capacity {
            self.evict_lru(&mut guard);
        }

        guard.entries.insert(
            fingerprint,
            CacheEntry {
                mapping: Arc::clone(&mapping),
                last_used: AtomicU64::new(self.next_tick()),
            },
        );

        debug!(fingerprint = %fingerprint, version = mapping.version, "Stored mapping");
        mapping
    }

    fn evict_lru(&self, inner: &mut CacheInner) {
        let oldest = inner
            .entries
            .iter()
            .min_by_key(|(_, e)| e.last_used.load(Ordering::Relaxed))
            .map(|(fp, _)| *fp);
        if let Some(fp) = oldest {
            inner.entries.remove(&fp);
            inner.retire(fp, self.capacity);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(fingerprint = %fp, "Evicted least recently used mapping");
        }
    }

    /// Remove the entry for `fingerprint`. Returns whether one existed.
    pub fn invalidate(&self, fingerprint: SchemaFingerprint) -> bool {
        let mut guard = self.inner.write();
        let removed = guard.entries.remove(&fingerprint).is_some();
        if removed {
            guard.retire(fingerprint, self.capacity);
            debug!(fingerprint = %fingerprint, "Invalidated mapping");
        }
        removed
    }

    /// Drop every entry and version history.
    pub fn reset(&self) -> usize {
        let mut guard = self.inner.write();
        let count = guard.entries.len();
        guard.entries.clear();
        guard.versions.clear();
        guard.retired.clear();
        info!(cleared = count, "Mapping cache reset");
        count
    }

    /// Snapshot of all cached mappings, sorted by fingerprint.
    pub fn entries(&self) -> Vec<Arc<FieldMapping>> {
        let guard = self.inner.read();
        let mut all: Vec<_> = guard.entries.values().map(|e| Arc::clone(&e.mapping)).collect();
        all.sort_by_key(|m| m.fingerprint);
        all
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

impl Default for MappingCache {
    fn default() -> Self {
        Self::new(1024)
    }
}
