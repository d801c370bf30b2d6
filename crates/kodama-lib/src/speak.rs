//! End-to-end orchestration of one `tts` invocation.
//!
//! Probes the engine, segments the text, annotates segments from the
//! cache, then runs playback and the optional `--out` export
//! concurrently. Playback pulls missing segments through the synthesis
//! channel while earlier segments are already sounding.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kodama_core::{segment_text, AppError, TextSegment, VoiceRequest, DEFAULT_MAX_SEGMENT_LEN};

use crate::cache::{CacheManager, CacheStats};
use crate::channel::{EngineSynthesizer, SpeechSynthesizer, SynthesisChannel};
use crate::codec;
use crate::config::AppConfig;
use crate::engine::{EngineClient, DEFAULT_READY_TIMEOUT};
use crate::filler::FillerStore;
use crate::player::{share_segments, SegmentPlayer};
use crate::retry::RetryPolicy;

/// Flags steering one invocation.
#[derive(Debug, Clone, Default)]
pub struct TtsOptions {
    pub no_cache: bool,
    pub cache_only: bool,
    pub out_path: Option<PathBuf>,
    pub no_play: bool,
}

/// Timings and counts reported after a run.
#[derive(Debug, Clone)]
pub struct TtsReport {
    pub segment_count: usize,
    pub cached_segments: usize,
    pub elapsed: Duration,
    pub cache_stats: Option<CacheStats>,
}

/// Run one tts invocation end to end.
pub async fn run_tts(
    cfg: &AppConfig,
    request: VoiceRequest,
    opts: TtsOptions,
    cancel: CancellationToken,
) -> Result<TtsReport, AppError> {
    let started = Instant::now();

    let engine = EngineClient::new(
        &cfg.voicevox.base_url,
        Duration::from_secs(cfg.voicevox.connection_timeout_secs),
    )?;
    engine.ensure_ready(DEFAULT_READY_TIMEOUT).await?;
    if !cfg.voicevox.keep_engine_running {
        debug!("engine lifecycle is external; leaving the process untouched on exit");
    }

    let synth: Arc<dyn SpeechSynthesizer> =
        Arc::new(EngineSynthesizer::new(engine, RetryPolicy::default()));

    if opts.no_cache {
        return run_uncached(cfg, &request, &opts, &synth, &cancel, started).await;
    }

    let cache = Arc::new(CacheManager::new(&cfg.cache, cancel.child_token())?);

    // TTL sweep in the background; lazy expiry on load still covers races.
    {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move {
            match cache.purge_expired().await {
                Ok(removed) if removed > 0 => debug!(removed, "purged expired cache entries"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "expired-entry purge failed"),
            }
        });
    }

    let mut segments = segment_text(&request.text, request.speaker_id, DEFAULT_MAX_SEGMENT_LEN);
    let cached_segments = annotate_segments(&cache, &mut segments, &request).await;
    let segment_count = segments.len();
    info!(
        segments = segment_count,
        cached = cached_segments,
        "request segmented"
    );

    if opts.cache_only && cached_segments < segment_count {
        return Err(AppError::ResourceNotFound {
            message: format!(
                "{} of {} segments are not cached",
                segment_count - cached_segments,
                segment_count
            ),
        });
    }

    let channel = SynthesisChannel::new(Arc::clone(&synth), Arc::clone(&cache), cancel.child_token());
    let filler = FillerStore::new(
        &cfg.filler,
        cfg.cache.use_executable_base_directory,
        cfg.voicevox.default_speaker,
    );
    let shared = share_segments(segments);

    let playback = async {
        if opts.no_play {
            // Still warm the cache so a later play is instant.
            for segment in &shared {
                let pending = {
                    let guard = segment.lock();
                    (!guard.is_cached).then(|| {
                        VoiceRequest::new(guard.text.clone(), guard.speaker_id).with_prosody(
                            request.speed,
                            request.pitch,
                            request.volume,
                        )
                    })
                };
                if let Some(seg_request) = pending {
                    let result = channel.process(seg_request).await?;
                    if !result.success {
                        return Err(AppError::AudioGenerationFailed {
                            message: result
                                .error_message
                                .unwrap_or_else(|| "synthesis failed".into()),
                        });
                    }
                }
            }
            Ok(())
        } else {
            let player = SegmentPlayer::new(&cfg.audio, cancel.clone())?;
            player
                .play_with_generation(&shared, &request, Some(&channel), Some(&filler))
                .await
        }
    };

    let export = async {
        match &opts.out_path {
            Some(path) => {
                // Single-shot full-text synthesis, bypassing segmentation,
                // so the file has no inter-segment seams.
                let wav = synth.synthesize_request(&request, &cancel).await?;
                let written = export_audio(path, &wav).await?;
                info!(path = %written.display(), "audio exported");
                Ok::<(), AppError>(())
            }
            None => Ok(()),
        }
    };

    let (play_result, export_result) = tokio::join!(playback, export);
    channel.shutdown().await;
    play_result?;
    export_result?;

    let cache_stats = cache.stats().await.ok();
    Ok(TtsReport {
        segment_count,
        cached_segments,
        elapsed: started.elapsed(),
        cache_stats,
    })
}

/// `--no-cache`: synthesize the whole text in one engine round-trip and
/// play and/or export it.
async fn run_uncached(
    cfg: &AppConfig,
    request: &VoiceRequest,
    opts: &TtsOptions,
    synth: &Arc<dyn SpeechSynthesizer>,
    cancel: &CancellationToken,
    started: Instant,
) -> Result<TtsReport, AppError> {
    let wav = synth.synthesize_request(request, cancel).await?;
    debug!(bytes = wav.len(), "uncached synthesis complete");

    if let Some(path) = &opts.out_path {
        let written = export_audio(path, &wav).await?;
        info!(path = %written.display(), "audio exported");
    }
    if !opts.no_play {
        let player = SegmentPlayer::new(&cfg.audio, cancel.clone())?;
        player.play_bytes(wav).await?;
    }

    Ok(TtsReport {
        segment_count: 1,
        cached_segments: 0,
        elapsed: started.elapsed(),
        cache_stats: None,
    })
}

/// Attach cached audio to each segment; returns the number of hits.
async fn annotate_segments(
    cache: &CacheManager,
    segments: &mut [TextSegment],
    template: &VoiceRequest,
) -> usize {
    let mut hits = 0;
    for segment in segments.iter_mut() {
        let seg_request = VoiceRequest::new(segment.text.clone(), segment.speaker_id)
            .with_prosody(template.speed, template.pitch, template.volume);
        if let Some(audio) = cache.get(&seg_request).await {
            segment.attach_audio(audio);
            hits += 1;
        }
    }
    hits
}

/// Write synthesized WAV bytes to `path` per the extension rules.
///
/// `.mp3` transcodes, falling back to a `.wav` sibling when the encoder
/// does not produce an MP3 header. Any other extension writes the WAV
/// bytes as-is, rewriting the extension to `.wav` (with a warning) when
/// it does not match the content.
pub async fn export_audio(path: &Path, wav: &[u8]) -> Result<PathBuf, AppError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    if ext.as_deref() == Some("mp3") {
        let input = wav.to_vec();
        let encoded = tokio::task::spawn_blocking(move || codec::wav_to_mp3(&input))
            .await
            .map_err(|e| AppError::UnknownError {
                message: format!("transcode task failed: {e}"),
            })?;
        return match encoded {
            Ok(mp3) if codec::is_mp3(&mp3) => {
                tokio::fs::write(path, &mp3).await.map_err(AppError::from)?;
                Ok(path.to_path_buf())
            }
            _ => {
                let fallback = path.with_extension("wav");
                warn!(
                    requested = %path.display(),
                    actual = %fallback.display(),
                    "mp3 encoding unavailable, writing wav instead"
                );
                tokio::fs::write(&fallback, wav)
                    .await
                    .map_err(AppError::from)?;
                Ok(fallback)
            }
        };
    }

    if ext.as_deref() != Some("wav") && codec::is_wav(wav) {
        let fixed = path.with_extension("wav");
        warn!(
            requested = %path.display(),
            actual = %fixed.display(),
            "content is wav, rewriting output extension"
        );
        tokio::fs::write(&fixed, wav).await.map_err(AppError::from)?;
        return Ok(fixed);
    }

    tokio::fs::write(path, wav).await.map_err(AppError::from)?;
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::testutil::make_wav;
    use tempfile::TempDir;

    fn cache_in(dir: &TempDir) -> CacheManager {
        let cfg = CacheConfig {
            directory: dir.path().to_path_buf(),
            use_executable_base_directory: false,
            ..CacheConfig::default()
        };
        CacheManager::new(&cfg, CancellationToken::new()).unwrap()
    }

    #[tokio::test]
    async fn annotate_marks_only_cached_segments() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir);
        let template = VoiceRequest::new("こんにちは。さようなら。", 1);

        let mut segments =
            segment_text(&template.text, template.speaker_id, DEFAULT_MAX_SEGMENT_LEN);
        assert_eq!(segments.len(), 2);

        // Pre-cache the first segment only.
        let first = VoiceRequest::new(segments[0].text.clone(), 1);
        cache
            .put(&first, make_wav(&[40i16; 1600], 16_000))
            .await
            .unwrap();

        let hits = annotate_segments(&cache, &mut segments, &template).await;
        assert_eq!(hits, 1);
        assert!(segments[0].is_cached);
        assert!(!segments[1].is_cached);
    }

    #[tokio::test]
    async fn export_wav_is_written_verbatim() {
        let dir = TempDir::new().unwrap();
        let wav = make_wav(&[10i16; 160], 16_000);
        let path = dir.path().join("out.wav");

        let written = export_audio(&path, &wav).await.unwrap();
        assert_eq!(written, path);
        assert_eq!(tokio::fs::read(&path).await.unwrap(), wav);
    }

    #[tokio::test]
    async fn export_rewrites_mismatched_extension() {
        let dir = TempDir::new().unwrap();
        let wav = make_wav(&[10i16; 160], 16_000);
        let path = dir.path().join("out.ogg");

        let written = export_audio(&path, &wav).await.unwrap();
        assert_eq!(written, dir.path().join("out.wav"));
        assert!(!path.exists());
        assert_eq!(tokio::fs::read(&written).await.unwrap(), wav);
    }

    #[tokio::test]
    async fn export_mp3_transcodes() {
        let dir = TempDir::new().unwrap();
        let wav = make_wav(&[500i16; 3200], 16_000);
        let path = dir.path().join("out.mp3");

        let written = export_audio(&path, &wav).await.unwrap();
        assert_eq!(written, path);
        let bytes = tokio::fs::read(&written).await.unwrap();
        assert!(codec::is_mp3(&bytes));
    }

    #[tokio::test]
    async fn export_mp3_with_undecodable_input_falls_back_to_wav() {
        let dir = TempDir::new().unwrap();
        // Not a decodable WAV; the encoder cannot produce MP3 from it.
        let bogus = b"RIFF....WAVEbut-not-really".to_vec();
        let path = dir.path().join("out.mp3");

        let written = export_audio(&path, &bogus).await.unwrap();
        assert_eq!(written, dir.path().join("out.wav"));
        assert_eq!(tokio::fs::read(&written).await.unwrap(), bogus);
    }
}
