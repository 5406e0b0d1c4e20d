//! Hot-context cache.
//!
//! Whole-bundle caching keyed by a fingerprint of (recent conversation
//! window, client id).  Rather than walking the cache on every canon-set
//! change, each kind carries a generation counter: a transition affecting a
//! kind bumps its generation, and a cached bundle whose snapshot no longer
//! matches is treated as a miss and evicted on the next lookup.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::schema::MemoryKind;

/// Snapshot of the cache performance counters.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub capacity: usize,
    pub len: usize,
    pub hits: u64,
    pub misses: u64,
    /// Hit rate as a percentage 0.0 – 100.0.
    pub hit_rate_pct: f32,
}

struct CachedValue<V> {
    value: V,
    generations: [u64; 3],
}

pub struct HotContextCache<V> {
    inner: Mutex<LruCache<String, CachedValue<V>>>,
    capacity: usize,
    generations: [AtomicU64; 3],
    hits: AtomicU64,
    misses: AtomicU64,
}

fn kind_slot(kind: MemoryKind) -> usize {
    match kind {
        MemoryKind::Jane => 0,
        MemoryKind::Client => 1,
        MemoryKind::Knowledge => 2,
    }
}

impl<V: Clone> HotContextCache<V> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).expect("capacity clamped to >= 1"),
            )),
            capacity,
            generations: [AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0)],
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn generation_snapshot(&self) -> [u64; 3] {
        [
            self.generations[0].load(Ordering::Acquire),
            self.generations[1].load(Ordering::Acquire),
            self.generations[2].load(Ordering::Acquire),
        ]
    }

    /// Non-blocking lookup.  A bundle cached before any contributing kind's
    /// canon set changed is stale and counts as a miss.
    pub async fn get(&self, fingerprint: &str) -> Option<V> {
        let current = self.generation_snapshot();
        let mut inner = self.inner.lock().await;
        match inner.get(fingerprint) {
            Some(cached) if cached.generations == current => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(cached.value.clone())
            }
            Some(_) => {
                inner.pop(fingerprint);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub async fn put(&self, fingerprint: String, value: V) {
        let generations = self.generation_snapshot();
        let mut inner = self.inner.lock().await;
        inner.put(fingerprint, CachedValue { value, generations });
    }

    /// Invalidate every bundle that could contain `kind` content.  Cheap: one
    /// counter bump; stale entries evict lazily.
    pub fn invalidate_kind(&self, kind: MemoryKind) {
        self.generations[kind_slot(kind)].fetch_add(1, Ordering::Release);
    }

    pub async fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        CacheStats {
            capacity: self.capacity,
            len: self.inner.lock().await.len(),
            hits,
            misses,
            hit_rate_pct: if hits + misses == 0 {
                0.0
            } else {
                (hits as f32 / (hits + misses) as f32) * 100.0
            },
        }
    }
}

/// Fingerprint of (recent conversation window, client id) used as the cache
/// key.
pub fn fingerprint(window: &str, client_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(window.as_bytes());
    hasher.update(b"\x00");
    hasher.update(client_id.as_bytes());
    format!("{:x}", hasher.finalize())
}
