//! In-memory LRU tier, bounded by total value bytes.
//!
//! Wraps an `lru_mem::LruCache` behind one short mutex: every lookup
//! promotes its entry to the MRU end, so even reads mutate and a shared
//! lock would buy nothing. Hit/miss counters are relaxed atomics. No I/O
//! ever happens under the lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use lru_mem::{HeapSize, LruCache};
use parking_lot::Mutex;
use tracing::debug;

/// One cached value with its absolute expiration.
struct MemoryItem {
    bytes: Vec<u8>,
    expires_at: Instant,
}

impl HeapSize for MemoryItem {
    fn heap_size(&self) -> usize {
        self.bytes.capacity()
    }
}

/// Counters and sizes reported by [`MemoryCache::stats`].
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryCacheStats {
    pub items: usize,
    pub expired_items: usize,
    pub current_bytes: usize,
    pub max_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

/// Thread-safe byte-bounded LRU over cache keys.
pub struct MemoryCache {
    entries: Mutex<LruCache<String, MemoryItem>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryCache {
    /// `max_bytes` bounds the cumulative entry size; `ttl` is applied as an
    /// absolute expiration at insert/update time.
    pub fn new(max_bytes: usize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(max_bytes)),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Insert or update. Updates move the entry to the MRU end; overflow
    /// evicts from the LRU end inside the underlying cache.
    pub fn set(&self, key: &str, bytes: Vec<u8>) {
        let mut entries = self.entries.lock();
        if bytes.len() > entries.max_size() {
            debug!(key, len = bytes.len(), "value exceeds memory cache capacity, skipping");
            return;
        }
        let item = MemoryItem {
            bytes,
            expires_at: Instant::now() + self.ttl,
        };
        if entries.insert(key.to_string(), item).is_err() {
            debug!(key, "memory cache insert rejected, entry too large");
        }
    }

    /// Fresh hit promotes to MRU and returns a copy of the bytes; an
    /// expired entry is removed and counts as a miss.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut entries = self.entries.lock();
        // None = absent, Some(None) = expired, Some(Some(_)) = fresh.
        let lookup = match entries.get(key) {
            None => None,
            Some(item) if item.expires_at > Instant::now() => Some(Some(item.bytes.clone())),
            Some(_) => Some(None),
        };
        match lookup {
            Some(Some(bytes)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(bytes)
            }
            Some(None) => {
                entries.remove(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Presence check without promotion; expired entries count as absent.
    pub fn contains(&self, key: &str) -> bool {
        let entries = self.entries.lock();
        entries
            .peek(key)
            .is_some_and(|item| item.expires_at > Instant::now())
    }

    pub fn remove(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn stats(&self) -> MemoryCacheStats {
        let entries = self.entries.lock();
        let now = Instant::now();
        let expired_items = entries
            .iter()
            .filter(|(_, item)| item.expires_at <= now)
            .count();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        MemoryCacheStats {
            items: entries.len(),
            expired_items,
            current_bytes: entries.current_size(),
            max_bytes: entries.max_size(),
            hits,
            misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }
}
