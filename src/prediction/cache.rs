// =============================================================================
// Prediction Cache — LRU with per-entry TTL
// =============================================================================
//
// Keyed by (instrument, second bucket of the frame timestamp): two frames
// for the same instrument inside the same second share one model result.
// Entries are stored with `cache_hit = false`; lookups return a copy with
// the flag flipped and a refreshed timestamp so downstream consumers can
// tell a served copy from the original computation.
// =============================================================================

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use lru::LruCache;
use parking_lot::Mutex;

use super::Prediction;

/// (instrument, floor(ts_ms / 1000)).
pub type CacheKey = (String, i64);

struct Entry {
    prediction: Prediction,
    stored_at: Instant,
}

pub struct PredictionCache {
    inner: Mutex<LruCache<CacheKey, Entry>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PredictionCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Bucket a frame timestamp (epoch ms) into the cache key granularity.
    pub fn bucket(ts_ms: i64) -> i64 {
        ts_ms.div_euclid(1000)
    }

    /// Look up a fresh entry. Expired entries are evicted on access.
    pub fn get(&self, key: &CacheKey) -> Option<Prediction> {
        let mut cache = self.inner.lock();

        let expired = matches!(
            cache.peek(key),
            Some(entry) if entry.stored_at.elapsed() > self.ttl
        );
        if expired {
            cache.pop(key);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        match cache.get(key) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                let mut served = entry.prediction.clone();
                served.cache_hit = true;
                served.timestamp = Utc::now().timestamp_millis();
                Some(served)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a freshly computed prediction. The stored copy always carries
    /// `cache_hit = false`.
    pub fn put(&self, key: CacheKey, mut prediction: Prediction) {
        prediction.cache_hit = false;
        self.inner.lock().put(
            key,
            Entry {
                prediction,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }
}
