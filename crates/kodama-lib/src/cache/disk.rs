//! On-disk cache tier: a flat directory of `<key>.mp3` / `<key>.meta.json`
//! pairs.
//!
//! Writes go to a temp file and are renamed into place, so readers see a
//! complete old file, a complete new file, or no file. There is no
//! locking; concurrent writers of one key leave exactly one survivor.
//! Corrupt, orphaned, or expired entries are repaired lazily on access by
//! deleting the pair and reporting a miss.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use tokio::fs;
use tracing::{debug, warn};

use kodama_core::{AppError, CacheMetadata, VoiceRequest};

use crate::codec;

/// One entry's accounting data for the size sweep.
#[derive(Debug, Clone)]
pub struct DiskEntry {
    pub key: String,
    pub audio_bytes: u64,
    pub created_at: DateTime<Utc>,
}

pub struct DiskStore {
    dir: PathBuf,
    ttl: Duration,
}

impl DiskStore {
    /// Open the store, creating `dir` if needed. `dir` must already be
    /// resolved (see [`crate::config::resolve_base_dir`]).
    pub fn new(dir: PathBuf, expiration_days: u32) -> Result<Self, AppError> {
        std::fs::create_dir_all(&dir).map_err(|e| classify_write(e, &dir))?;
        Ok(Self {
            dir,
            ttl: Duration::days(expiration_days as i64),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn audio_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.mp3"))
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.meta.json"))
    }

    /// Load an entry. Any invalid, expired, or half-present pair is
    /// deleted and reported as a miss; this never fails the caller.
    pub async fn load(&self, key: &str) -> Option<(Vec<u8>, CacheMetadata)> {
        let meta_path = self.meta_path(key);
        let audio_path = self.audio_path(key);

        let meta_bytes = match fs::read(&meta_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if fs::try_exists(&audio_path).await.unwrap_or(false) {
                    warn!(key, "audio file without metadata, removing orphan");
                    self.delete(key).await;
                }
                return None;
            }
            Err(e) => {
                warn!(key, error = %e, "failed to read cache metadata, removing entry");
                self.delete(key).await;
                return None;
            }
        };

        let meta: CacheMetadata = match serde_json::from_slice(&meta_bytes) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(key, error = %e, "corrupt cache metadata, removing entry");
                self.delete(key).await;
                return None;
            }
        };

        if !meta.is_valid() {
            warn!(key, "invalid cache metadata, removing entry");
            self.delete(key).await;
            return None;
        }
        if meta.is_expired(self.ttl, Utc::now()) {
            debug!(key, created_at = %meta.created_at, "cache entry expired");
            self.delete(key).await;
            return None;
        }

        match fs::read(&audio_path).await {
            Ok(audio) if !audio.is_empty() => Some((audio, meta)),
            Ok(_) => {
                warn!(key, "empty cache audio file, removing entry");
                self.delete(key).await;
                None
            }
            Err(e) => {
                if e.kind() == io::ErrorKind::NotFound {
                    warn!(key, "metadata without audio file, removing orphan");
                } else {
                    warn!(key, error = %e, "failed to read cache audio, removing entry");
                }
                self.delete(key).await;
                None
            }
        }
    }

    /// Encode `wav` to MP3 and persist audio + metadata atomically.
    /// Returns the encoded bytes for the memory tier.
    pub async fn store(
        &self,
        key: &str,
        wav: Vec<u8>,
        request: &VoiceRequest,
    ) -> Result<Vec<u8>, AppError> {
        let mp3 = tokio::task::spawn_blocking(move || codec::wav_to_mp3(&wav))
            .await
            .map_err(|e| AppError::UnknownError {
                message: format!("transcode task failed: {e}"),
            })??;

        let meta = CacheMetadata::for_request(request);
        let meta_json =
            serde_json::to_vec_pretty(&meta).map_err(|e| AppError::CacheWriteError {
                message: format!("metadata serialization: {e}"),
            })?;

        self.write_atomic(&self.audio_path(key), &mp3).await?;
        self.write_atomic(&self.meta_path(key), &meta_json).await?;
        debug!(key, bytes = mp3.len(), "cache entry written");
        Ok(mp3)
    }

    /// Write-then-rename keeps readers from ever seeing a torn file. The
    /// temp name is unique per writer so concurrent processes racing on
    /// one key cannot interleave; the last rename wins.
    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), AppError> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = self
            .dir
            .join(format!("{file_name}.{}.tmp", uuid::Uuid::new_v4().simple()));
        fs::write(&tmp, bytes)
            .await
            .map_err(|e| classify_write(e, &tmp))?;
        fs::rename(&tmp, path)
            .await
            .map_err(|e| classify_write(e, path))
    }

    /// Best-effort removal of both files; missing files are fine.
    pub async fn delete(&self, key: &str) {
        for path in [self.audio_path(key), self.meta_path(key)] {
            if let Err(e) = fs::remove_file(&path).await {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "failed to delete cache file");
                }
            }
        }
    }

    /// Keys of all audio files currently present.
    pub async fn list_keys(&self) -> Result<Vec<String>, AppError> {
        let mut keys = Vec::new();
        let mut dir = fs::read_dir(&self.dir)
            .await
            .map_err(|e| classify_read(e, &self.dir))?;
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| classify_read(e, &self.dir))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "mp3") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    keys.push(stem.to_string());
                }
            }
        }
        Ok(keys)
    }

    /// Accounting data for every entry, oldest first.
    ///
    /// Age comes from the metadata `CreatedAt`, falling back to the audio
    /// file's mtime when the sidecar is unreadable.
    pub async fn entries(&self) -> Result<Vec<DiskEntry>, AppError> {
        let mut entries = Vec::new();
        for key in self.list_keys().await? {
            let audio_path = self.audio_path(key.as_str());
            let Ok(file_meta) = fs::metadata(&audio_path).await else {
                continue;
            };

            let created_at = match fs::read(self.meta_path(&key)).await {
                Ok(bytes) => serde_json::from_slice::<CacheMetadata>(&bytes)
                    .ok()
                    .map(|m| m.created_at),
                Err(_) => None,
            };
            let created_at = match created_at {
                Some(ts) => ts,
                None => file_meta
                    .modified()
                    .ok()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(Utc::now),
            };

            entries.push(DiskEntry {
                key,
                audio_bytes: file_meta.len(),
                created_at,
            });
        }
        entries.sort_by_key(|e| e.created_at);
        Ok(entries)
    }

    /// Total bytes of audio currently on disk.
    pub async fn total_audio_bytes(&self) -> Result<u64, AppError> {
        Ok(self.entries().await?.iter().map(|e| e.audio_bytes).sum())
    }

    /// Delete oldest entries until the total audio size is at or below
    /// `max_bytes`. Returns the number of entries removed.
    pub async fn enforce_size_cap(&self, max_bytes: u64) -> Result<usize, AppError> {
        let entries = self.entries().await?;
        let mut total: u64 = entries.iter().map(|e| e.audio_bytes).sum();
        if total <= max_bytes {
            return Ok(0);
        }

        let mut removed = 0;
        for entry in entries {
            if total <= max_bytes {
                break;
            }
            debug!(
                key = %entry.key,
                bytes = entry.audio_bytes,
                created_at = %entry.created_at,
                "evicting cache entry for size cap"
            );
            self.delete(&entry.key).await;
            total = total.saturating_sub(entry.audio_bytes);
            removed += 1;
        }
        Ok(removed)
    }

    /// Delete every entry older than the TTL. Returns the number removed.
    pub async fn purge_expired(&self) -> Result<usize, AppError> {
        let now = Utc::now();
        let mut removed = 0;
        for entry in self.entries().await? {
            if now - entry.created_at > self.ttl {
                debug!(key = %entry.key, created_at = %entry.created_at, "purging expired entry");
                self.delete(&entry.key).await;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Remove every entry.
    pub async fn clear(&self) -> Result<usize, AppError> {
        let keys = self.list_keys().await?;
        let count = keys.len();
        for key in keys {
            self.delete(&key).await;
        }
        // Stray meta files without audio are cleaned up too.
        let mut dir = fs::read_dir(&self.dir)
            .await
            .map_err(|e| classify_read(e, &self.dir))?;
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| classify_read(e, &self.dir))?
        {
            let path = entry.path();
            if path.to_string_lossy().ends_with(".meta.json") {
                let _ = fs::remove_file(&path).await;
            }
        }
        Ok(count)
    }
}

fn classify_write(err: io::Error, path: &Path) -> AppError {
    match err.kind() {
        io::ErrorKind::PermissionDenied => AppError::CachePermissionDenied {
            path: path.display().to_string(),
        },
        io::ErrorKind::StorageFull => AppError::CacheFull {
            message: err.to_string(),
        },
        _ => AppError::CacheWriteError {
            message: format!("{}: {err}", path.display()),
        },
    }
}

fn classify_read(err: io::Error, path: &Path) -> AppError {
    match err.kind() {
        io::ErrorKind::PermissionDenied => AppError::CachePermissionDenied {
            path: path.display().to_string(),
        },
        _ => AppError::CacheReadError {
            message: format!("{}: {err}", path.display()),
        },
    }
}
