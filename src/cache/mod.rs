//! Per-node session read cache.
//!
//! Bounded map with a short per-entry TTL so a node answers repeated
//! lookups for its own hot sessions without a store round trip. Writes
//! always go to the store first; this cache only ever holds what the
//! store returned. The admission path never consults it.

use crate::types::SessionRecord;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

struct CachedSession {
    record: SessionRecord,
    cached_at: Instant,
}

pub struct SessionReadCache {
    entries: DashMap<String, CachedSession>,
    max_entries: usize,
    ttl: Duration,
    metrics: CacheMetrics,
}

impl SessionReadCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            entries: DashMap::with_capacity(max_entries.min(1024)),
            max_entries,
            ttl,
            metrics: CacheMetrics::default(),
        }
    }

    /// Fresh cached record, if any. Stale entries are dropped on the way
    /// out.
    pub fn get(&self, id: &str) -> Option<SessionRecord> {
        if let Some(entry) = self.entries.get(id) {
            if entry.cached_at.elapsed() < self.ttl {
                self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.record.clone());
            }
            drop(entry);
            self.entries.remove(id);
        }
        self.metrics.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Install the record the store just returned.
    pub fn put(&self, record: SessionRecord) {
        self.maybe_evict();
        self.entries.insert(
            record.id.clone(),
            CachedSession {
                record,
                cached_at: Instant::now(),
            },
        );
    }

    /// Drop an entry whose cached state external evidence contradicts.
    pub fn invalidate(&self, id: &str) {
        if self.entries.remove(id).is_some() {
            self.metrics.invalidations.fetch_add(1, Ordering::Relaxed);
            debug!(session_id = id, "cache entry invalidated");
        }
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Oldest-first eviction once the map is full.
    fn maybe_evict(&self) {
        if self.entries.len() < self.max_entries {
            return;
        }
        let mut oldest: Option<(String, Instant)> = None;
        for entry in self.entries.iter() {
            let stamp = entry.value().cached_at;
            match &oldest {
                Some((_, current)) if *current <= stamp => {}
                _ => oldest = Some((entry.key().clone(), stamp)),
            }
        }
        if let Some((key, _)) = oldest {
            self.entries.remove(&key);
            self.metrics.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.metrics.hits.load(Ordering::Relaxed),
            misses: self.metrics.misses.load(Ordering::Relaxed),
            evictions: self.metrics.evictions.load(Ordering::Relaxed),
            invalidations: self.metrics.invalidations.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
}

#[derive(Debug, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
}
