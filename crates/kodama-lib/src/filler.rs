//! Pre-synthesized interjection library.
//!
//! Short clips ("ええと", "あの", …) played between segments while the
//! next one is still synthesizing. Files are named with the same cache
//! key function as the main cache and live in their own directory;
//! selection is uniform over the texts, excluding the previous pick.

use std::path::PathBuf;

use parking_lot::Mutex;
use rand::Rng;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kodama_core::{AppError, VoiceRequest};

use crate::cache::CacheManager;
use crate::channel::SpeechSynthesizer;
use crate::codec;
use crate::config::{resolve_base_dir, FillerConfig};

pub struct FillerStore {
    enabled: bool,
    dir: PathBuf,
    texts: Vec<String>,
    speaker_id: u32,
    last_index: Mutex<Option<usize>>,
}

impl FillerStore {
    pub fn new(cfg: &FillerConfig, use_executable_base: bool, speaker_id: u32) -> Self {
        Self {
            enabled: cfg.enabled,
            dir: resolve_base_dir(&cfg.directory, use_executable_base),
            texts: cfg.texts.clone(),
            speaker_id,
            last_index: Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled && !self.texts.is_empty()
    }

    fn key_for_text(&self, text: &str) -> String {
        CacheManager::key_for(&VoiceRequest::new(text, self.speaker_id))
    }

    fn mp3_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.mp3"))
    }

    fn wav_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.wav"))
    }

    /// Synthesize any filler texts that have no backing file yet.
    /// Returns the number of clips synthesized.
    pub async fn initialize(
        &self,
        synth: &dyn SpeechSynthesizer,
        cancel: &CancellationToken,
    ) -> Result<usize, AppError> {
        if !self.is_enabled() {
            return Ok(0);
        }
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| AppError::CacheWriteError {
                message: format!("{}: {e}", self.dir.display()),
            })?;

        let mut synthesized = 0;
        for text in &self.texts {
            let key = self.key_for_text(text);
            let mp3 = self.mp3_path(&key);
            let wav = self.wav_path(&key);
            if fs::try_exists(&mp3).await.unwrap_or(false)
                || fs::try_exists(&wav).await.unwrap_or(false)
            {
                continue;
            }

            let request = VoiceRequest::new(text.clone(), self.speaker_id);
            let bytes = synth.synthesize_request(&request, cancel).await?;
            // The engine hands back WAV; keep whatever container it is.
            let path = if codec::is_mp3(&bytes) { mp3 } else { wav };
            fs::write(&path, &bytes)
                .await
                .map_err(|e| AppError::CacheWriteError {
                    message: format!("{}: {e}", path.display()),
                })?;
            info!(text, path = %path.display(), "filler clip synthesized");
            synthesized += 1;
        }
        Ok(synthesized)
    }

    /// A random clip, never the same as the previous one (unless only one
    /// text is configured). Read errors degrade to `None`.
    pub async fn get_random(&self) -> Option<Vec<u8>> {
        if !self.is_enabled() {
            return None;
        }

        let index = {
            let mut last = self.last_index.lock();
            let picked = pick_index(self.texts.len(), *last, &mut rand::thread_rng());
            *last = Some(picked);
            picked
        };

        let key = self.key_for_text(&self.texts[index]);
        for path in [self.mp3_path(&key), self.wav_path(&key)] {
            match fs::read(&path).await {
                Ok(bytes) if !bytes.is_empty() => {
                    debug!(text = %self.texts[index], "filler clip selected");
                    return Some(bytes);
                }
                Ok(_) => warn!(path = %path.display(), "filler clip is empty"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "failed to read filler clip"),
            }
        }
        None
    }

    /// Delete every clip file; individual failures are tolerated.
    pub async fn clear(&self) -> usize {
        let Ok(mut dir) = fs::read_dir(&self.dir).await else {
            return 0;
        };
        let mut removed = 0;
        while let Ok(Some(entry)) = dir.next_entry().await {
            let path = entry.path();
            let is_clip = path
                .extension()
                .is_some_and(|ext| ext == "mp3" || ext == "wav");
            if is_clip {
                match fs::remove_file(&path).await {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(path = %path.display(), error = %e, "failed to delete filler clip"),
                }
            }
        }
        removed
    }
}

/// Uniform pick over `0..len` that avoids `last` when possible.
fn pick_index<R: Rng>(len: usize, last: Option<usize>, rng: &mut R) -> usize {
    debug_assert!(len > 0);
    match last {
        Some(last) if len > 1 => {
            let mut index = rng.gen_range(0..len - 1);
            if index >= last {
                index += 1;
            }
            index
        }
        _ => rng.gen_range(0..len),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir, texts: &[&str], enabled: bool) -> FillerStore {
        let cfg = FillerConfig {
            enabled,
            directory: dir.path().to_path_buf(),
            texts: texts.iter().map(|t| t.to_string()).collect(),
        };
        FillerStore::new(&cfg, false, 1)
    }

    #[test]
    fn pick_never_repeats_with_multiple_texts() {
        let mut rng = rand::thread_rng();
        let mut last = Some(1);
        for _ in 0..200 {
            let picked = pick_index(3, last, &mut rng);
            assert!(picked < 3);
            assert_ne!(Some(picked), last);
            last = Some(picked);
        }
    }

    #[test]
    fn pick_with_single_text_repeats() {
        let mut rng = rand::thread_rng();
        assert_eq!(pick_index(1, Some(0), &mut rng), 0);
        assert_eq!(pick_index(1, None, &mut rng), 0);
    }

    #[tokio::test]
    async fn disabled_store_returns_none() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, &["ええと"], false);
        assert!(!store.is_enabled());
        assert!(store.get_random().await.is_none());
    }

    #[tokio::test]
    async fn reads_clip_bytes_from_disk() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, &["ええと"], true);

        let key = store.key_for_text("ええと");
        fs::write(store.wav_path(&key), b"RIFFwavbytes").await.unwrap();

        assert_eq!(store.get_random().await.unwrap(), b"RIFFwavbytes");
    }

    #[tokio::test]
    async fn prefers_mp3_over_wav() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, &["あの"], true);

        let key = store.key_for_text("あの");
        fs::write(store.mp3_path(&key), b"mp3bytes").await.unwrap();
        fs::write(store.wav_path(&key), b"wavbytes").await.unwrap();

        assert_eq!(store.get_random().await.unwrap(), b"mp3bytes");
    }

    #[tokio::test]
    async fn missing_backing_file_degrades_to_none() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, &["えー"], true);
        assert!(store.get_random().await.is_none());
    }

    #[tokio::test]
    async fn clear_removes_clip_files() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, &["ええと"], true);
        fs::write(dir.path().join("a.mp3"), b"x").await.unwrap();
        fs::write(dir.path().join("b.wav"), b"y").await.unwrap();
        fs::write(dir.path().join("keep.txt"), b"z").await.unwrap();

        assert_eq!(store.clear().await, 2);
        assert!(dir.path().join("keep.txt").exists());
    }
}
