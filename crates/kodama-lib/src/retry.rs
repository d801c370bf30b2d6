//! Retry policy and circuit breaker for engine calls.
//!
//! Every engine call goes through [`RetryPolicy::run`]: at most three
//! attempts with exponential backoff and jitter, a 30 s per-call timeout,
//! and a shared circuit breaker that fast-fails calls after three
//! consecutive retryable failures. Caller cancellation is observed at
//! every await point and never counts as a breaker failure.

use std::future::Future;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use kodama_core::AppError;

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Delays never drop below this floor, jitter included.
const DELAY_FLOOR: Duration = Duration::from_millis(100);
/// Jitter span added to each backoff delay.
const JITTER_MS: i64 = 100;
/// Minimum delay component after a rate-limit response.
const RATE_LIMIT_FLOOR: Duration = Duration::from_secs(1);

const BREAKER_FAILURE_THRESHOLD: u32 = 3;
const BREAKER_COOLDOWN: Duration = Duration::from_secs(30);

// ─── Circuit breaker ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Consecutive-failure circuit breaker.
///
/// Opens after `failure_threshold` retryable failures in a row, stays open
/// for `cooldown`, then admits a single half-open probe. The probe's
/// outcome closes or re-opens the circuit.
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    failure_threshold: u32,
    cooldown: Duration,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BREAKER_FAILURE_THRESHOLD, BREAKER_COOLDOWN)
    }
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
            failure_threshold: failure_threshold.max(1),
            cooldown,
        }
    }

    /// Admit a call, or fail fast with [`AppError::CircuitOpen`].
    ///
    /// An open circuit whose cooldown has elapsed transitions to half-open
    /// and admits exactly this caller as the probe.
    pub fn try_acquire(&self) -> Result<(), AppError> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::HalfOpen => Err(AppError::CircuitOpen),
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(self.cooldown);
                if elapsed >= self.cooldown {
                    inner.state = BreakerState::HalfOpen;
                    debug!("circuit breaker half-open, admitting probe");
                    Ok(())
                } else {
                    Err(AppError::CircuitOpen)
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != BreakerState::Closed {
            debug!("circuit breaker closed");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::HalfOpen => {
                warn!("circuit breaker probe failed, re-opening");
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
            }
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    warn!(
                        failures = inner.consecutive_failures,
                        "circuit breaker opened"
                    );
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }
}

// ─── Retry policy ──────────────────────────────────────────────────────────

/// Bounded-retry wrapper shared by all engine calls.
#[derive(Debug)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    call_timeout: Duration,
    breaker: CircuitBreaker,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            breaker: CircuitBreaker::default(),
        }
    }
}

impl RetryPolicy {
    #[cfg(test)]
    fn for_test(call_timeout: Duration, breaker: CircuitBreaker) -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            call_timeout,
            breaker,
        }
    }

    /// Run `op` with retries, timeout, breaker, and cancellation.
    ///
    /// Non-retryable errors return immediately and leave the breaker
    /// untouched. Cancellation aborts between and during attempts and is
    /// never counted as a failure.
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let mut last_err: Option<AppError> = None;

        for attempt in 1..=self.max_attempts {
            self.breaker.try_acquire()?;

            if attempt > 1 {
                let rate_limited = last_err.as_ref().is_some_and(|e| e.is_rate_limited());
                let delay = self.jittered_delay(attempt, rate_limited);
                debug!(attempt, ?delay, "backing off before retry");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(AppError::OperationCancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AppError::OperationCancelled),
                res = tokio::time::timeout(self.call_timeout, op()) => res,
            };

            let err = match outcome {
                Ok(Ok(value)) => {
                    self.breaker.record_success();
                    return Ok(value);
                }
                Ok(Err(e)) => e,
                Err(_) => AppError::ApiTimeout {
                    message: format!("call exceeded {:.0?}", self.call_timeout),
                },
            };

            if !err.is_retryable() {
                return Err(err);
            }

            self.breaker.record_failure();
            warn!(attempt, error = %err, "engine call failed");
            last_err = Some(err);
        }

        Err(last_err.unwrap_or(AppError::UnknownError {
            message: "retry attempts exhausted".into(),
        }))
    }

    /// Backoff delay before attempt `n` (n ≥ 2), jitter applied.
    fn jittered_delay(&self, attempt: u32, rate_limited: bool) -> Duration {
        let base = backoff_base(attempt, self.base_delay, self.max_delay, rate_limited);
        let jitter_ms = rand::thread_rng().gen_range(-JITTER_MS..=JITTER_MS);
        let jittered = if jitter_ms >= 0 {
            base + Duration::from_millis(jitter_ms as u64)
        } else {
            base.saturating_sub(Duration::from_millis(jitter_ms.unsigned_abs()))
        };
        jittered.max(DELAY_FLOOR)
    }
}

/// Exponential backoff base for attempt `n`: `min(max, base * 2^(n-2))`,
/// raised to one second after a rate-limit response.
fn backoff_base(attempt: u32, base: Duration, max: Duration, rate_limited: bool) -> Duration {
    let exp = attempt.saturating_sub(2).min(16);
    let delay = base.saturating_mul(1u32 << exp).min(max);
    if rate_limited {
        delay.max(RATE_LIMIT_FLOOR)
    } else {
        delay
    }
}
