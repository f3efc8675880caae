//! HTTP page fetching, retry policy and atomic file persistence for jobstream.

use std::fmt::Display;
use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;
use reqwest::StatusCode;
use tokio::sync::Mutex;
use tracing::debug;

mod fetch;
mod files;

pub use fetch::{extract_listings, FetchConfig, FetchError, PageFetcher, PageResult, LISTING_KEYS};
pub use files::{BatchFileWriter, BatchMetadata, FileWriteError, WrittenBatch};

pub const CRATE_NAME: &str = "jobstream-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    pub fn max_attempts(&self) -> usize {
        self.max_retries + 1
    }
}

/// Bounded retry loop with exponential backoff, shared by page fetching and
/// batch persistence.
///
/// The caller supplies the operation and a predicate deciding, per error,
/// whether another attempt is allowed. The predicate is `FnMut` so callers can
/// fold each failure into their own bookkeeping (the circuit breaker does).
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPolicy {
    pub backoff: BackoffPolicy,
}

impl RetryPolicy {
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self { backoff }
    }

    pub fn max_attempts(&self) -> usize {
        self.backoff.max_attempts()
    }

    pub async fn run<T, E, Op, Fut, Pred>(
        &self,
        operation: &str,
        mut op: Op,
        mut disposition: Pred,
    ) -> Result<T, E>
    where
        Op: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        Pred: FnMut(&E, usize) -> RetryDisposition,
        E: Display,
    {
        let max_attempts = self.max_attempts();
        let mut attempt = 0usize;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let retryable = disposition(&err, attempt) == RetryDisposition::Retryable;
                    if !retryable || attempt + 1 >= max_attempts {
                        return Err(err);
                    }
                    let delay = self.backoff.delay_for_attempt(attempt);
                    debug!(
                        operation,
                        attempt = attempt + 1,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "attempt failed; backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Scales `base` by a uniform factor in `[0.5, 1.5)`.
pub fn jittered(base: Duration) -> Duration {
    let factor: f64 = rand::thread_rng().gen_range(0.5..1.5);
    base.mul_f64(factor)
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

/// Paces outgoing requests to at most `capacity` per `refill_every`.
#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            capacity: config.capacity.max(1),
            refill_every: config.refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: config.capacity.max(1),
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every.saturating_sub(elapsed);
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}
