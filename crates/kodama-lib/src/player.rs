//! Ordered segment playback with filler insertion.
//!
//! ```text
//! play_with_generation(segments) → per segment:
//!     ensure audio (cache-annotated | channel.process | poll fallback)
//!     → [cmd_tx] playback OS thread: rodio Sink, oneshot done-ack
//!     → next segment not ready? play a filler clip first
//! ```
//!
//! The rodio `OutputStream` is `!Send`, so the device lives on a
//! dedicated OS thread that acknowledges each clip through a oneshot once
//! the sink drains. The async side owns pacing, the 30 s per-clip
//! timeout, and cancellation; a stop command empties the sink mid-clip.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use rodio::source::Source;
use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use kodama_core::{AppError, TextSegment, VoiceRequest};

use crate::channel::SynthesisChannel;
use crate::codec::{self, AudioFormat};
use crate::config::AudioConfig;
use crate::filler::FillerStore;

/// Device warm-up delay before the first segment.
const FIRST_SEGMENT_LEAD: Duration = Duration::from_millis(200);
const NEXT_SEGMENT_LEAD: Duration = Duration::from_millis(20);
/// Trailing flush after the first segment.
const FIRST_SEGMENT_FLUSH: Duration = Duration::from_millis(150);
const NEXT_SEGMENT_FLUSH: Duration = Duration::from_millis(100);
const INTER_SEGMENT_PAUSE: Duration = Duration::from_millis(50);

/// Hard wall-clock limit on one clip's playback-complete signal.
const PLAYBACK_TIMEOUT: Duration = Duration::from_secs(30);
/// Poll cadence and limit for the channel-less fallback wait.
const FALLBACK_POLL_INTERVAL: Duration = Duration::from_millis(100);
const FALLBACK_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Segment shared between the annotating side and the player.
pub type SharedSegment = Arc<parking_lot::Mutex<TextSegment>>;

pub fn share_segments(segments: Vec<TextSegment>) -> Vec<SharedSegment> {
    segments
        .into_iter()
        .map(|s| Arc::new(parking_lot::Mutex::new(s)))
        .collect()
}

// ─── Playback thread protocol ──────────────────────────────────────────────

#[derive(Debug)]
enum PlayFailure {
    Device(String),
    Decode(String),
    Stopped,
}

enum PlayCmd {
    Play {
        bytes: Vec<u8>,
        done: oneshot::Sender<Result<(), PlayFailure>>,
    },
    Stop,
    Shutdown,
}

/// Settings the playback thread needs, detached from `AudioConfig`.
#[derive(Debug, Clone)]
struct PlayerSettings {
    volume: f32,
    output_device: i32,
    prepare_device: bool,
    preparation_duration: Duration,
    desired_latency_ms: u64,
    number_of_buffers: u32,
}

impl From<&AudioConfig> for PlayerSettings {
    fn from(cfg: &AudioConfig) -> Self {
        Self {
            volume: cfg.volume as f32,
            output_device: cfg.output_device,
            prepare_device: cfg.prepare_device,
            preparation_duration: Duration::from_millis(cfg.preparation_duration_ms),
            desired_latency_ms: cfg.desired_latency_ms,
            number_of_buffers: cfg.number_of_buffers,
        }
    }
}

// ─── Player handle ─────────────────────────────────────────────────────────

/// Streams segments to the audio output in order, inserting fillers while
/// the next segment is still synthesizing.
pub struct SegmentPlayer {
    cmd_tx: mpsc::UnboundedSender<PlayCmd>,
    cancel: CancellationToken,
}

impl SegmentPlayer {
    /// Spawn the playback thread. The audio device itself is opened
    /// lazily on the first clip.
    pub fn new(cfg: &AudioConfig, cancel: CancellationToken) -> Result<Self, AppError> {
        let settings = PlayerSettings::from(cfg);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<PlayCmd>();
        std::thread::Builder::new()
            .name("kodama-playback".into())
            .spawn(move || playback_thread(cmd_rx, settings))
            .map_err(|e| AppError::AudioGenerationFailed {
                message: format!("failed to spawn playback thread: {e}"),
            })?;
        Ok(Self { cmd_tx, cancel })
    }

    /// Play every segment in order.
    ///
    /// Segments without audio are pulled through `channel` when present,
    /// otherwise the player polls their `is_cached` flag (100 ms cadence,
    /// 30 s limit). Between segments whose successor is not ready, a
    /// filler clip is played when a `filler` store is provided.
    pub async fn play_with_generation(
        &self,
        segments: &[SharedSegment],
        template: &VoiceRequest,
        channel: Option<&SynthesisChannel>,
        filler: Option<&FillerStore>,
    ) -> Result<(), AppError> {
        for (index, segment) in segments.iter().enumerate() {
            let bytes = self.ensure_audio(segment, template, channel).await?;
            self.play_clip(bytes, index == 0).await?;

            if let Some(next) = segments.get(index + 1) {
                self.delay(INTER_SEGMENT_PAUSE).await?;
                let next_ready = next.lock().is_cached;
                if !next_ready {
                    if let Some(filler) = filler {
                        if let Some(clip) = filler.get_random().await {
                            debug!(next = index + 1, "masking synthesis latency with filler");
                            self.play_clip(clip, false).await?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Play a single pre-loaded buffer (used by the no-cache path).
    pub async fn play_bytes(&self, bytes: Vec<u8>) -> Result<(), AppError> {
        self.play_clip(bytes, true).await
    }

    /// Stop the device and discard anything queued.
    pub fn stop(&self) {
        let _ = self.cmd_tx.send(PlayCmd::Stop);
    }

    async fn ensure_audio(
        &self,
        segment: &SharedSegment,
        template: &VoiceRequest,
        channel: Option<&SynthesisChannel>,
    ) -> Result<Vec<u8>, AppError> {
        if let Some(bytes) = cached_audio(segment) {
            return Ok(bytes);
        }

        match channel {
            Some(channel) => {
                let request = {
                    let guard = segment.lock();
                    VoiceRequest::new(guard.text.clone(), guard.speaker_id).with_prosody(
                        template.speed,
                        template.pitch,
                        template.volume,
                    )
                };
                let result = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => {
                        self.stop();
                        return Err(AppError::OperationCancelled);
                    }
                    result = channel.process(request) => result?,
                };
                if !result.success {
                    return Err(AppError::AudioGenerationFailed {
                        message: result
                            .error_message
                            .unwrap_or_else(|| "synthesis failed".into()),
                    });
                }
                segment.lock().attach_audio(result.audio.clone());
                Ok(result.audio)
            }
            None => {
                let deadline = tokio::time::Instant::now() + FALLBACK_WAIT_TIMEOUT;
                loop {
                    if let Some(bytes) = cached_audio(segment) {
                        return Ok(bytes);
                    }
                    if tokio::time::Instant::now() >= deadline {
                        return Err(AppError::TimeoutError {
                            message: format!(
                                "segment audio not ready within {}s",
                                FALLBACK_WAIT_TIMEOUT.as_secs()
                            ),
                        });
                    }
                    self.delay(FALLBACK_POLL_INTERVAL).await?;
                }
            }
        }
    }

    /// One clip: lead-in delay, play, await the drain ack under the 30 s
    /// limit, trailing flush delay.
    async fn play_clip(&self, bytes: Vec<u8>, first: bool) -> Result<(), AppError> {
        let lead = if first { FIRST_SEGMENT_LEAD } else { NEXT_SEGMENT_LEAD };
        self.delay(lead).await?;

        let (done_tx, done_rx) = oneshot::channel();
        self.cmd_tx
            .send(PlayCmd::Play {
                bytes,
                done: done_tx,
            })
            .map_err(|_| AppError::AudioGenerationFailed {
                message: "playback thread is gone".into(),
            })?;

        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.stop();
                return Err(AppError::OperationCancelled);
            }
            outcome = tokio::time::timeout(PLAYBACK_TIMEOUT, done_rx) => outcome,
        };

        match outcome {
            Err(_) => {
                self.stop();
                Err(AppError::AudioPlaybackTimeout {
                    seconds: PLAYBACK_TIMEOUT.as_secs(),
                })
            }
            Ok(Err(_)) => Err(AppError::AudioGenerationFailed {
                message: "playback thread dropped the clip".into(),
            }),
            Ok(Ok(Err(PlayFailure::Stopped))) => Err(AppError::OperationCancelled),
            Ok(Ok(Err(PlayFailure::Decode(message)))) => {
                Err(AppError::AudioGenerationFailed { message })
            }
            Ok(Ok(Err(PlayFailure::Device(message)))) => {
                Err(AppError::AudioGenerationFailed { message })
            }
            Ok(Ok(Ok(()))) => {
                let flush = if first { FIRST_SEGMENT_FLUSH } else { NEXT_SEGMENT_FLUSH };
                self.delay(flush).await
            }
        }
    }

    /// Cancellation-aware sleep; a cancel stops the device.
    async fn delay(&self, duration: Duration) -> Result<(), AppError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.stop();
                Err(AppError::OperationCancelled)
            }
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

impl Drop for SegmentPlayer {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(PlayCmd::Shutdown);
    }
}

fn cached_audio(segment: &SharedSegment) -> Option<Vec<u8>> {
    let guard = segment.lock();
    if guard.is_cached {
        guard.audio_data.clone()
    } else {
        None
    }
}

// ─── Playback OS thread ────────────────────────────────────────────────────

struct Output {
    // Keeps the device alive; the handle is what sinks are built from.
    _stream: OutputStream,
    handle: OutputStreamHandle,
    sink: Sink,
}

enum DrainOutcome {
    Finished,
    Stopped,
    Shutdown,
}

fn playback_thread(mut cmd_rx: mpsc::UnboundedReceiver<PlayCmd>, settings: PlayerSettings) {
    let mut output: Option<Output> = None;

    loop {
        match cmd_rx.blocking_recv() {
            Some(PlayCmd::Play { bytes, done }) => {
                let out = match ensure_output(&mut output, &settings) {
                    Ok(out) => out,
                    Err(message) => {
                        error!(%message, "failed to open audio output");
                        let _ = done.send(Err(PlayFailure::Device(message)));
                        continue;
                    }
                };
                match decode_clip(bytes) {
                    Ok(source) => out.sink.append(source),
                    Err(message) => {
                        let _ = done.send(Err(PlayFailure::Decode(message)));
                        continue;
                    }
                }
                match wait_for_drain(&out.sink, &mut cmd_rx) {
                    DrainOutcome::Finished => {
                        let _ = done.send(Ok(()));
                    }
                    DrainOutcome::Stopped => {
                        let _ = done.send(Err(PlayFailure::Stopped));
                        recreate_sink(&mut output, &settings);
                    }
                    DrainOutcome::Shutdown => {
                        let _ = done.send(Err(PlayFailure::Stopped));
                        return;
                    }
                }
            }
            Some(PlayCmd::Stop) => {
                if output.is_some() {
                    recreate_sink(&mut output, &settings);
                }
            }
            Some(PlayCmd::Shutdown) | None => {
                if let Some(out) = &output {
                    out.sink.stop();
                }
                return;
            }
        }
    }
}

/// Block until the sink drains, staying responsive to stop commands.
fn wait_for_drain(sink: &Sink, cmd_rx: &mut mpsc::UnboundedReceiver<PlayCmd>) -> DrainOutcome {
    use tokio::sync::mpsc::error::TryRecvError;

    loop {
        if sink.empty() {
            return DrainOutcome::Finished;
        }
        match cmd_rx.try_recv() {
            Ok(PlayCmd::Stop) => {
                sink.stop();
                return DrainOutcome::Stopped;
            }
            Ok(PlayCmd::Shutdown) => {
                sink.stop();
                return DrainOutcome::Shutdown;
            }
            Ok(PlayCmd::Play { done, .. }) => {
                // The async side serializes clips; overlap means a bug.
                let _ = done.send(Err(PlayFailure::Device(
                    "playback already in progress".into(),
                )));
            }
            Err(TryRecvError::Empty) => std::thread::sleep(Duration::from_millis(10)),
            Err(TryRecvError::Disconnected) => {
                sink.stop();
                return DrainOutcome::Shutdown;
            }
        }
    }
}

/// Open the output lazily on first use.
fn ensure_output<'a>(
    output: &'a mut Option<Output>,
    settings: &PlayerSettings,
) -> Result<&'a mut Output, String> {
    if output.is_none() {
        debug!(
            device = settings.output_device,
            latency_ms = settings.desired_latency_ms,
            buffers = settings.number_of_buffers,
            "opening audio output"
        );
        let (stream, handle) = open_stream(settings.output_device)?;
        let sink = Sink::try_new(&handle).map_err(|e| format!("failed to create sink: {e}"))?;
        sink.set_volume(settings.volume);

        if settings.prepare_device && !settings.preparation_duration.is_zero() {
            // A short burst of silence wakes the device up so the first
            // audible clip does not clip its onset.
            let silence = rodio::source::Zero::<f32>::new(1, 44_100)
                .take_duration(settings.preparation_duration);
            sink.append(silence);
            sink.sleep_until_end();
        }

        *output = Some(Output {
            _stream: stream,
            handle,
            sink,
        });
    }
    Ok(output.as_mut().expect("output just initialized"))
}

fn open_stream(device_index: i32) -> Result<(OutputStream, OutputStreamHandle), String> {
    if device_index >= 0 {
        use cpal::traits::HostTrait;
        let host = cpal::default_host();
        let device = host
            .output_devices()
            .map_err(|e| format!("failed to enumerate output devices: {e}"))?
            .nth(device_index as usize)
            .ok_or_else(|| format!("no output device at index {device_index}"))?;
        OutputStream::try_from_device(&device)
            .map_err(|e| format!("failed to open output device {device_index}: {e}"))
    } else {
        OutputStream::try_default().map_err(|e| format!("failed to open default output: {e}"))
    }
}

/// A stopped rodio sink stays empty, so build a fresh one on the same
/// stream handle.
fn recreate_sink(output: &mut Option<Output>, settings: &PlayerSettings) {
    let Some(mut out) = output.take() else { return };
    out.sink.stop();
    match Sink::try_new(&out.handle) {
        Ok(sink) => {
            sink.set_volume(settings.volume);
            out.sink = sink;
            *output = Some(out);
        }
        Err(e) => {
            warn!(error = %e, "failed to recreate sink, reopening device on next clip");
        }
    }
}

/// Pick the decoder from the sniffed container; unknown buffers try MP3
/// first, then WAV.
fn decode_clip(bytes: Vec<u8>) -> Result<Decoder<Cursor<Vec<u8>>>, String> {
    match codec::detect_format(&bytes) {
        AudioFormat::Wav => Decoder::new_wav(Cursor::new(bytes)).map_err(|e| format!("wav decode: {e}")),
        AudioFormat::Mp3 => Decoder::new_mp3(Cursor::new(bytes)).map_err(|e| format!("mp3 decode: {e}")),
        AudioFormat::Unknown => Decoder::new_mp3(Cursor::new(bytes.clone()))
            .or_else(|_| Decoder::new_wav(Cursor::new(bytes)))
            .map_err(|e| format!("audio decode: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheManager;
    use crate::channel::SpeechSynthesizer;
    use crate::config::CacheConfig;
    use crate::testutil::make_wav;
    use async_trait::async_trait;
    use kodama_core::segment_text;
    use tempfile::TempDir;

    fn player() -> SegmentPlayer {
        SegmentPlayer::new(&AudioConfig::default(), CancellationToken::new()).unwrap()
    }

    fn one_segment(text: &str) -> Vec<SharedSegment> {
        share_segments(segment_text(text, 1, 100))
    }

    struct FailingSynth;

    #[async_trait]
    impl SpeechSynthesizer for FailingSynth {
        async fn synthesize_request(
            &self,
            _request: &VoiceRequest,
            _cancel: &CancellationToken,
        ) -> Result<Vec<u8>, AppError> {
            Err(AppError::EngineProcessError {
                message: "no engine in tests".into(),
            })
        }
    }

    struct WavSynth;

    #[async_trait]
    impl SpeechSynthesizer for WavSynth {
        async fn synthesize_request(
            &self,
            _request: &VoiceRequest,
            _cancel: &CancellationToken,
        ) -> Result<Vec<u8>, AppError> {
            Ok(make_wav(&[32i16; 1600], 16_000))
        }
    }

    fn channel_in(dir: &TempDir, synth: Arc<dyn SpeechSynthesizer>) -> SynthesisChannel {
        let cfg = CacheConfig {
            directory: dir.path().to_path_buf(),
            use_executable_base_directory: false,
            ..CacheConfig::default()
        };
        let cache = Arc::new(CacheManager::new(&cfg, CancellationToken::new()).unwrap());
        SynthesisChannel::new(synth, cache, CancellationToken::new())
    }

    #[tokio::test]
    async fn preloaded_segment_returns_its_audio() {
        let player = player();
        let segments = one_segment("こんにちは。");
        segments[0].lock().attach_audio(vec![9, 9, 9]);

        let bytes = player
            .ensure_audio(&segments[0], &VoiceRequest::new("x", 1), None)
            .await
            .unwrap();
        assert_eq!(bytes, vec![9, 9, 9]);
    }

    #[tokio::test]
    async fn channel_fills_missing_segment_and_marks_it() {
        let dir = TempDir::new().unwrap();
        let channel = channel_in(&dir, Arc::new(WavSynth));
        let player = player();
        let segments = one_segment("こんにちは。");

        let bytes = player
            .ensure_audio(
                &segments[0],
                &VoiceRequest::new("こんにちは。", 1),
                Some(&channel),
            )
            .await
            .unwrap();
        assert!(!bytes.is_empty());
        assert!(segments[0].lock().is_cached);
        channel.shutdown().await;
    }

    #[tokio::test]
    async fn channel_failure_is_fatal_for_the_request() {
        let dir = TempDir::new().unwrap();
        let channel = channel_in(&dir, Arc::new(FailingSynth));
        let player = player();
        let segments = one_segment("だめ。");

        let err = player
            .ensure_audio(&segments[0], &VoiceRequest::new("だめ。", 1), Some(&channel))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "Audio.AudioGenerationFailed");
        channel.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_poll_times_out_without_audio() {
        let player = player();
        let segments = one_segment("まだです。");

        let err = player
            .ensure_audio(&segments[0], &VoiceRequest::new("x", 1), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "General.TimeoutError");
    }

    #[tokio::test]
    async fn fallback_poll_picks_up_late_audio() {
        let player = player();
        let segments = one_segment("あとで。");

        let seg = Arc::clone(&segments[0]);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            seg.lock().attach_audio(vec![7, 7]);
        });

        let bytes = player
            .ensure_audio(&segments[0], &VoiceRequest::new("x", 1), None)
            .await
            .unwrap();
        assert_eq!(bytes, vec![7, 7]);
    }

    #[tokio::test]
    async fn cancellation_surfaces_as_cancelled() {
        let cancel = CancellationToken::new();
        let player = SegmentPlayer::new(&AudioConfig::default(), cancel.clone()).unwrap();
        cancel.cancel();

        let segments = one_segment("キャンセル。");
        let err = player
            .ensure_audio(&segments[0], &VoiceRequest::new("x", 1), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "General.OperationCancelled");
    }

    #[test]
    fn segment_request_inherits_template_prosody() {
        let segments = one_segment("テスト。");
        let template = VoiceRequest::new("whole text", 1).with_prosody(1.3, -0.2, 0.9);
        let guard = segments[0].lock();
        let request = VoiceRequest::new(guard.text.clone(), guard.speaker_id).with_prosody(
            template.speed,
            template.pitch,
            template.volume,
        );
        assert_eq!(request.text, "テスト。");
        assert_eq!(request.speed, 1.3);
        assert_eq!(request.pitch, -0.2);
        assert_eq!(request.volume, 0.9);
    }
}
