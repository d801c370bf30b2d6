//! Two-tier audio cache: memory LRU over the on-disk store.
//!
//! Gets try memory first, then disk (hydrating memory on a disk hit).
//! Puts write through to disk first, then memory, so a completed put is
//! immediately observable by the next get. Every put schedules a
//! fire-and-forget size sweep that evicts oldest-by-creation entries
//! once the disk total exceeds the configured cap.

pub mod disk;
pub mod memory;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use kodama_core::{AppError, VoiceRequest};

pub use disk::{DiskEntry, DiskStore};
pub use memory::{MemoryCache, MemoryCacheStats};

use crate::config::{CacheConfig, resolve_base_dir};

/// Wall-clock budget for one background size sweep.
const SWEEP_BUDGET: Duration = Duration::from_secs(5 * 60);

const SECS_PER_DAY: u64 = 24 * 60 * 60;
const MIB: u64 = 1024 * 1024;
const GIB: f64 = (1024u64 * 1024 * 1024) as f64;

/// Combined statistics for both tiers.
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub memory: MemoryCacheStats,
    pub disk_entries: usize,
    pub disk_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

pub struct CacheManager {
    memory: MemoryCache,
    disk: Arc<DiskStore>,
    max_disk_bytes: u64,
    cancel: CancellationToken,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheManager {
    pub fn new(cfg: &CacheConfig, cancel: CancellationToken) -> Result<Self, AppError> {
        let dir = resolve_base_dir(&cfg.directory, cfg.use_executable_base_directory);
        let disk = Arc::new(DiskStore::new(dir, cfg.expiration_days)?);
        let ttl = Duration::from_secs(cfg.expiration_days as u64 * SECS_PER_DAY);
        let memory = MemoryCache::new((cfg.memory_cache_size_mb * MIB) as usize, ttl);
        Ok(Self {
            memory,
            disk,
            max_disk_bytes: (cfg.max_size_gb * GIB) as u64,
            cancel,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    /// The deterministic cache key for a request. Also used by the filler
    /// store to name its files.
    pub fn key_for(request: &VoiceRequest) -> String {
        request.cache_key()
    }

    pub async fn get(&self, request: &VoiceRequest) -> Option<Vec<u8>> {
        self.get_by_key(&Self::key_for(request)).await
    }

    /// Memory first, then disk. A disk hit hydrates the memory tier.
    pub async fn get_by_key(&self, key: &str) -> Option<Vec<u8>> {
        if let Some(bytes) = self.memory.get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(bytes);
        }
        if let Some((audio, _meta)) = self.disk.load(key).await {
            self.memory.set(key, audio.clone());
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(audio);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Write through to disk (authoritative), then memory. The stored and
    /// returned value is the MP3-encoded form of `wav`.
    pub async fn put(&self, request: &VoiceRequest, wav: Vec<u8>) -> Result<Vec<u8>, AppError> {
        let key = Self::key_for(request);
        let mp3 = self.disk.store(&key, wav, request).await?;
        self.memory.set(&key, mp3.clone());
        self.schedule_size_sweep();
        Ok(mp3)
    }

    /// Fire-and-forget size enforcement, budgeted and cancellable.
    fn schedule_size_sweep(&self) {
        let disk = Arc::clone(&self.disk);
        let cancel = self.cancel.clone();
        let max_bytes = self.max_disk_bytes;
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                outcome = tokio::time::timeout(SWEEP_BUDGET, disk.enforce_size_cap(max_bytes)) => {
                    match outcome {
                        Ok(Ok(removed)) if removed > 0 => {
                            debug!(removed, "size sweep evicted entries");
                        }
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => warn!(error = %e, "size sweep failed"),
                        Err(_) => warn!("size sweep exceeded its budget"),
                    }
                }
            }
        });
    }

    /// Run size enforcement in the foreground (tests, `clear --resize`).
    pub async fn enforce_size_cap(&self) -> Result<usize, AppError> {
        self.disk.enforce_size_cap(self.max_disk_bytes).await
    }

    /// Delete expired disk entries eagerly.
    pub async fn purge_expired(&self) -> Result<usize, AppError> {
        self.disk.purge_expired().await
    }

    /// Wipe both tiers. Returns the number of disk entries removed.
    pub async fn clear(&self) -> Result<usize, AppError> {
        self.memory.clear();
        self.disk.clear().await
    }

    pub async fn stats(&self) -> Result<CacheStats, AppError> {
        let entries = self.disk.entries().await?;
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        Ok(CacheStats {
            memory: self.memory.stats(),
            disk_entries: entries.len(),
            disk_bytes: entries.iter().map(|e| e.audio_bytes).sum(),
            hits,
            misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::make_wav;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> CacheConfig {
        CacheConfig {
            directory: dir.path().to_path_buf(),
            use_executable_base_directory: false,
            expiration_days: 30,
            max_size_gb: 1.0,
            memory_cache_size_mb: 8,
        }
    }

    fn manager_in(dir: &TempDir) -> CacheManager {
        CacheManager::new(&test_config(dir), CancellationToken::new()).unwrap()
    }

    fn request() -> VoiceRequest {
        VoiceRequest::new("こんにちは。", 1)
    }

    #[tokio::test]
    async fn put_then_get_returns_encoded_bytes() {
        let dir = TempDir::new().unwrap();
        let manager = manager_in(&dir);
        let req = request();

        let wav = make_wav(&[50i16; 1600], 16_000);
        let stored = manager.put(&req, wav).await.unwrap();
        assert!(crate::codec::is_mp3(&stored));

        let got = manager.get(&req).await.unwrap();
        assert_eq!(got, stored);
    }

    #[tokio::test]
    async fn entries_survive_a_fresh_manager() {
        let dir = TempDir::new().unwrap();
        let req = request();
        let stored = {
            let manager = manager_in(&dir);
            let wav = make_wav(&[50i16; 1600], 16_000);
            manager.put(&req, wav).await.unwrap()
        };

        // Same directory, new manager: must hit via disk.
        let manager = manager_in(&dir);
        let got = manager.get(&req).await.unwrap();
        assert_eq!(got, stored);
    }

    #[tokio::test]
    async fn disk_hit_hydrates_memory() {
        let dir = TempDir::new().unwrap();
        let req = request();
        {
            let manager = manager_in(&dir);
            let wav = make_wav(&[50i16; 1600], 16_000);
            manager.put(&req, wav).await.unwrap();
        }

        let manager = manager_in(&dir);
        manager.get(&req).await.unwrap();
        // Second get is served from memory.
        manager.get(&req).await.unwrap();
        assert!(manager.stats().await.unwrap().memory.hits >= 1);
    }

    #[tokio::test]
    async fn miss_is_counted() {
        let dir = TempDir::new().unwrap();
        let manager = manager_in(&dir);
        assert!(manager.get(&request()).await.is_none());
        let stats = manager.stats().await.unwrap();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);
    }

    #[tokio::test]
    async fn clear_misses_every_key() {
        let dir = TempDir::new().unwrap();
        let manager = manager_in(&dir);
        let req = request();
        manager
            .put(&req, make_wav(&[50i16; 1600], 16_000))
            .await
            .unwrap();

        let removed = manager.clear().await.unwrap();
        assert_eq!(removed, 1);
        assert!(manager.get(&req).await.is_none());
        assert_eq!(manager.stats().await.unwrap().disk_entries, 0);
    }

    #[tokio::test]
    async fn key_for_matches_request_key() {
        let req = request();
        assert_eq!(CacheManager::key_for(&req), req.cache_key());
    }
}
