//! Retry, backoff, and timeout utilities.
//!
//! The helpers in this module are transport-agnostic. The identity client
//! uses them for optional request retries and the broker worker uses the
//! backoff schedule between reconnect attempts.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

/// Attempt budget and doubling backoff schedule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: usize,
    pub initial_backoff: Duration,
    /// Ceiling for every computed delay, jitter included.
    pub max_backoff: Duration,
    pub jitter: Duration,
}

impl RetryPolicy {
    /// Runs the operation exactly once; failures are returned to the caller.
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// Unbounded reconnect schedule starting at one second and doubling up
    /// to `ceiling`.
    pub fn reconnect(ceiling: Duration) -> Self {
        let initial_backoff = std::cmp::min(Duration::from_secs(1), ceiling);
        Self {
            max_attempts: usize::MAX,
            initial_backoff,
            max_backoff: ceiling,
            jitter: Duration::from_millis(100),
        }
    }

    /// Delay to wait after the 1-based `attempt` failed.
    ///
    /// Backoff doubles from `initial_backoff`; the jittered result never
    /// exceeds `max_backoff`.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let doublings = attempt.saturating_sub(1).min(32) as u32;
        let base = self
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(doublings))
            .min(self.max_backoff);
        (base + jitter_duration(self.jitter, attempt)).min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::single_attempt()
    }
}

/// Runs `op` until it succeeds, the attempt budget is spent, or
/// `should_retry` rejects an error.
///
/// `op` is called with the 1-based attempt number.
pub async fn retry_async<T, E, Op, Fut, ShouldRetry>(
    policy: &RetryPolicy,
    mut op: Op,
    mut should_retry: ShouldRetry,
) -> Result<T, E>
where
    Op: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    ShouldRetry: FnMut(&E) -> bool,
{
    let budget = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let error = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        if attempt >= budget || !should_retry(&error) {
            return Err(error);
        }

        let delay = policy.delay_for_attempt(attempt);
        debug!(
            event = "retry_scheduled",
            attempt,
            budget,
            delay_ms = delay.as_millis() as u64
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

/// Bounds `future` by `timeout`.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}

/// Pseudo-random jitter in `[0, max_jitter]`, mixed from the clock and the
/// attempt number.
fn jitter_duration(max_jitter: Duration, attempt: usize) -> Duration {
    let limit = max_jitter.as_millis() as u64;
    if limit == 0 {
        return Duration::ZERO;
    }
    let clock = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::from(elapsed.subsec_nanos()))
        .unwrap_or_default();
    let mixed = clock.rotate_left(17) ^ (attempt as u64).wrapping_mul(0xA076_1D64_78BD_642F);
    Duration::from_millis(mixed % (limit + 1))
}
