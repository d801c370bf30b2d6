//! Bounded synthesis work queue.
//!
//! ```text
//! process(request) → [task_tx cap=100] → worker pool (3)
//!     → cache get → miss: engine under retry → cache put
//!     → oneshot reply to the waiting caller
//! ```
//!
//! Producers block when the queue is full. Each task carries a oneshot
//! reply sender, so concurrent callers only ever observe their own
//! result; a caller that goes away leaves its task running and the
//! result is discarded when the reply send fails.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use kodama_core::{AppError, VoiceRequest};

use crate::cache::CacheManager;
use crate::engine::EngineClient;
use crate::retry::RetryPolicy;

/// Work queue capacity; senders wait when it is full.
pub const CHANNEL_CAPACITY: usize = 100;
const WORKER_COUNT: usize = 3;
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

/// The engine-facing seam: text in, WAV bytes out.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize_request(
        &self,
        request: &VoiceRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, AppError>;
}

/// Production synthesizer: audio query then synthesis, each under the
/// retry policy.
pub struct EngineSynthesizer {
    engine: EngineClient,
    retry: RetryPolicy,
}

impl EngineSynthesizer {
    pub fn new(engine: EngineClient, retry: RetryPolicy) -> Self {
        Self { engine, retry }
    }
}

#[async_trait]
impl SpeechSynthesizer for EngineSynthesizer {
    async fn synthesize_request(
        &self,
        request: &VoiceRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, AppError> {
        let query = self
            .retry
            .run(cancel, || self.engine.audio_query(request))
            .await?;
        self.retry
            .run(cancel, || self.engine.synthesize(&query, request.speaker_id))
            .await
    }
}

/// One unit of work on the queue.
struct SynthesisTask {
    id: Uuid,
    request: VoiceRequest,
    enqueued_at: Instant,
    reply: oneshot::Sender<SynthesisResult>,
}

/// Outcome delivered to the requesting caller.
#[derive(Debug, Clone)]
pub struct SynthesisResult {
    pub task_id: Uuid,
    pub audio: Vec<u8>,
    pub from_cache: bool,
    pub elapsed: Duration,
    pub success: bool,
    pub error_message: Option<String>,
}

impl SynthesisResult {
    fn success(task_id: Uuid, audio: Vec<u8>, from_cache: bool, elapsed: Duration) -> Self {
        Self {
            task_id,
            audio,
            from_cache,
            elapsed,
            success: true,
            error_message: None,
        }
    }

    fn failure(task_id: Uuid, message: String, elapsed: Duration) -> Self {
        Self {
            task_id,
            audio: Vec::new(),
            from_cache: false,
            elapsed,
            success: false,
            error_message: Some(message),
        }
    }
}

/// Bounded multi-producer work queue with a fixed worker pool.
pub struct SynthesisChannel {
    task_tx: mpsc::Sender<SynthesisTask>,
    workers: Vec<JoinHandle<()>>,
}

impl SynthesisChannel {
    pub fn new(
        synth: Arc<dyn SpeechSynthesizer>,
        cache: Arc<CacheManager>,
        cancel: CancellationToken,
    ) -> Self {
        Self::with_capacity(CHANNEL_CAPACITY, WORKER_COUNT, synth, cache, cancel)
    }

    pub fn with_capacity(
        capacity: usize,
        worker_count: usize,
        synth: Arc<dyn SpeechSynthesizer>,
        cache: Arc<CacheManager>,
        cancel: CancellationToken,
    ) -> Self {
        let (task_tx, task_rx) = mpsc::channel::<SynthesisTask>(capacity.max(1));
        let task_rx = Arc::new(Mutex::new(task_rx));

        let workers = (0..worker_count.max(1))
            .map(|worker| {
                let task_rx = Arc::clone(&task_rx);
                let synth = Arc::clone(&synth);
                let cache = Arc::clone(&cache);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    worker_loop(worker, task_rx, synth, cache, cancel).await;
                })
            })
            .collect();

        Self { task_tx, workers }
    }

    /// Enqueue a request and wait for its result. Blocks while the queue
    /// is at capacity.
    pub async fn process(&self, request: VoiceRequest) -> Result<SynthesisResult, AppError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let task = SynthesisTask {
            id: Uuid::new_v4(),
            request,
            enqueued_at: Instant::now(),
            reply: reply_tx,
        };
        self.task_tx
            .send(task)
            .await
            .map_err(|_| AppError::UnknownError {
                message: "synthesis channel is closed".into(),
            })?;
        reply_rx.await.map_err(|_| AppError::UnknownError {
            message: "synthesis worker dropped the task".into(),
        })
    }

    /// Close the queue and wait for workers to drain, up to 5 s.
    pub async fn shutdown(self) {
        drop(self.task_tx);
        let deadline = tokio::time::Instant::now() + SHUTDOWN_DEADLINE;
        for handle in self.workers {
            let abort = handle.abort_handle();
            if tokio::time::timeout_at(deadline, handle).await.is_err() {
                warn!("synthesis worker missed the shutdown deadline, aborting");
                abort.abort();
            }
        }
    }
}

async fn worker_loop(
    worker: usize,
    task_rx: Arc<Mutex<mpsc::Receiver<SynthesisTask>>>,
    synth: Arc<dyn SpeechSynthesizer>,
    cache: Arc<CacheManager>,
    cancel: CancellationToken,
) {
    loop {
        let task = {
            let mut rx = task_rx.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                task = rx.recv() => task,
            }
        };
        let Some(task) = task else {
            debug!(worker, "synthesis worker stopping");
            break;
        };

        let SynthesisTask {
            id,
            request,
            enqueued_at,
            reply,
        } = task;

        let result = execute(id, &request, enqueued_at, &synth, &cache, &cancel).await;
        // A send failure means the caller went away; drop the result.
        let _ = reply.send(result);
    }
}

async fn execute(
    task_id: Uuid,
    request: &VoiceRequest,
    enqueued_at: Instant,
    synth: &Arc<dyn SpeechSynthesizer>,
    cache: &Arc<CacheManager>,
    cancel: &CancellationToken,
) -> SynthesisResult {
    if let Some(audio) = cache.get(request).await {
        debug!(%task_id, "synthesis served from cache");
        return SynthesisResult::success(task_id, audio, true, enqueued_at.elapsed());
    }

    let wav = match synth.synthesize_request(request, cancel).await {
        Ok(wav) => wav,
        Err(e) => {
            warn!(%task_id, error = %e, "synthesis failed");
            return SynthesisResult::failure(task_id, e.to_string(), enqueued_at.elapsed());
        }
    };

    match cache.put(request, wav).await {
        Ok(mp3) => SynthesisResult::success(task_id, mp3, false, enqueued_at.elapsed()),
        Err(e) => {
            warn!(%task_id, error = %e, "cache write after synthesis failed");
            SynthesisResult::failure(task_id, e.to_string(), enqueued_at.elapsed())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::testutil::make_wav;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    struct MockSynth {
        calls: AtomicU32,
        fail: bool,
    }

    impl MockSynth {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl SpeechSynthesizer for MockSynth {
        async fn synthesize_request(
            &self,
            request: &VoiceRequest,
            _cancel: &CancellationToken,
        ) -> Result<Vec<u8>, AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(AppError::EngineProcessError {
                    message: "mock failure".into(),
                });
            }
            // Length depends on the text so distinct requests synthesize
            // distinct audio.
            let n = 160 * (1 + request.text.chars().count());
            Ok(make_wav(&vec![64i16; n], 16_000))
        }
    }

    fn cache_in(dir: &TempDir) -> Arc<CacheManager> {
        let cfg = CacheConfig {
            directory: dir.path().to_path_buf(),
            use_executable_base_directory: false,
            ..CacheConfig::default()
        };
        Arc::new(CacheManager::new(&cfg, CancellationToken::new()).unwrap())
    }

    #[tokio::test]
    async fn miss_synthesizes_and_caches() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir);
        let synth = MockSynth::new(false);
        let channel = SynthesisChannel::new(synth.clone(), cache, CancellationToken::new());

        let result = channel
            .process(VoiceRequest::new("こんにちは。", 1))
            .await
            .unwrap();
        assert!(result.success);
        assert!(!result.from_cache);
        assert!(!result.audio.is_empty());
        assert_eq!(synth.calls.load(Ordering::SeqCst), 1);

        // Identical request again: zero further engine calls.
        let result = channel
            .process(VoiceRequest::new("こんにちは。", 1))
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.from_cache);
        assert_eq!(synth.calls.load(Ordering::SeqCst), 1);

        channel.shutdown().await;
    }

    #[tokio::test]
    async fn failure_result_carries_message() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir);
        let channel =
            SynthesisChannel::new(MockSynth::new(true), cache, CancellationToken::new());

        let result = channel
            .process(VoiceRequest::new("だめ。", 1))
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.audio.is_empty());
        assert!(result.error_message.as_deref().unwrap().contains("mock failure"));

        channel.shutdown().await;
    }

    #[tokio::test]
    async fn concurrent_callers_observe_their_own_results() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir);
        let channel = Arc::new(SynthesisChannel::new(
            MockSynth::new(false),
            cache,
            CancellationToken::new(),
        ));

        let a = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { channel.process(VoiceRequest::new("短い。", 1)).await })
        };
        let b = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move {
                channel
                    .process(VoiceRequest::new("こちらはずっと長い文です。", 1))
                    .await
            })
        };

        let ra = a.await.unwrap().unwrap();
        let rb = b.await.unwrap().unwrap();
        assert!(ra.success && rb.success);
        assert_ne!(ra.task_id, rb.task_id);
        // Mock audio length tracks text length, so the payloads differ.
        assert_ne!(ra.audio.len(), rb.audio.len());
    }

    #[tokio::test]
    async fn shutdown_completes_promptly() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir);
        let channel =
            SynthesisChannel::new(MockSynth::new(false), cache, CancellationToken::new());

        tokio::time::timeout(Duration::from_secs(6), channel.shutdown())
            .await
            .expect("shutdown must not hang");
    }

    #[tokio::test]
    async fn single_worker_processes_in_order() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir);
        let channel = SynthesisChannel::with_capacity(
            4,
            1,
            MockSynth::new(false),
            cache,
            CancellationToken::new(),
        );

        for text in ["一。", "二。", "三。"] {
            let result = channel.process(VoiceRequest::new(text, 1)).await.unwrap();
            assert!(result.success);
        }
        channel.shutdown().await;
    }
}
