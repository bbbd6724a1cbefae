//! Retry logic with exponential backoff and jitter.
//!
//! Provides configurable retry behavior for network operations with:
//! - Exponential backoff (delay doubles each retry)
//! - Additive jitter to keep many clients from retrying in lockstep
//! - Classification-driven retry decisions
//! - Cancellable waits and statistics tracking
//!
//! `max_attempts` counts retries, not calls: with the default of 3 an
//! operation runs at most four times.

use crate::cancel::CancellationToken;
use crate::config::ResilienceDefaults;
use crate::{BulwarkError, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt.
    pub max_attempts: u32,
    /// Base delay, doubled per retry.
    pub base_delay: Duration,
    /// Upper bound of the uniform random jitter added to each delay.
    pub jitter_window: Duration,
    /// Cap on the exponential part of the delay.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: ResilienceDefaults::MAX_ATTEMPTS,
            base_delay: ResilienceDefaults::BASE_DELAY,
            jitter_window: ResilienceDefaults::JITTER_WINDOW,
            max_delay: ResilienceDefaults::MAX_DELAY,
        }
    }
}

impl RetryConfig {
    /// Create a new retry config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of retries.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the base delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the jitter window. `Duration::ZERO` disables jitter.
    pub fn with_jitter_window(mut self, window: Duration) -> Self {
        self.jitter_window = window;
        self
    }

    /// Set the maximum delay cap.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }
}

/// Progress of one logical operation through its retries.
///
/// Create one per operation and drop it on success or exhaustion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryState {
    /// Retries taken so far.
    pub attempt: u32,
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryState {
    pub fn is_exhausted(&self) -> bool {
        self.attempt > self.max_attempts
    }
}

/// Computes backoff delays and waits them out.
#[derive(Debug, Clone, Default)]
pub struct BackoffScheduler {
    config: RetryConfig,
}

impl BackoffScheduler {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Fresh state for a new logical operation.
    pub fn start(&self) -> RetryState {
        RetryState {
            attempt: 0,
            max_attempts: self.config.max_attempts,
            base_delay: self.config.base_delay,
        }
    }

    /// Exponential part of the delay for a retry number, capped at `max_delay`.
    pub fn base_delay_for(&self, state: &RetryState) -> Duration {
        let multiplier = 2f64.powi(state.attempt.min(63) as i32);
        let secs = state.base_delay.as_secs_f64() * multiplier;
        Duration::from_secs_f64(secs.min(self.config.max_delay.as_secs_f64()))
    }

    /// Delay before the retry numbered `state.attempt`, or `None` once the
    /// operation has used up its retries.
    pub fn next_delay(&self, state: &RetryState) -> Option<Duration> {
        if state.is_exhausted() {
            return None;
        }
        Some(self.base_delay_for(state) + self.jitter())
    }

    /// Advance `state` to the next retry and wait out its delay.
    ///
    /// Returns the delay that was waited, `Ok(None)` when retries are
    /// exhausted (no wait happens), or `Cancelled` if the token fires first.
    /// `floor` raises the delay, e.g. to honor a server `Retry-After`; it is
    /// clamped to `max_delay`.
    pub async fn wait(
        &self,
        state: &mut RetryState,
        floor: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Option<Duration>> {
        state.attempt += 1;
        let Some(delay) = self.next_delay(state) else {
            return Ok(None);
        };
        let delay = floor.map_or(delay, |floor| {
            delay.max(floor.min(self.config.max_delay))
        });

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Backoff wait cancelled at retry {}", state.attempt);
                Err(BulwarkError::Cancelled)
            }
            _ = tokio::time::sleep(delay) => Ok(Some(delay)),
        }
    }

    fn jitter(&self) -> Duration {
        let window_ms = self.config.jitter_window.as_millis() as u64;
        if window_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=window_ms))
    }
}

/// Statistics about a retry operation.
#[derive(Debug, Clone, Default)]
pub struct RetryStats {
    /// Number of calls made (first attempt plus retries).
    pub attempts: u32,
    /// Total delay accumulated.
    pub total_delay: Duration,
    /// Whether the operation ultimately succeeded.
    pub success: bool,
    /// Last error message if failed.
    pub last_error: Option<String>,
}

/// Retry an async operation with exponential backoff.
///
/// Non-retryable errors are returned as-is after the first failure. Retryable
/// errors are retried until the scheduler is exhausted, after which the last
/// error comes back wrapped in `RetriesExhausted`.
///
/// # Returns
///
/// A tuple of (Result, RetryStats)
pub async fn retry_async<F, Fut, T>(
    scheduler: &BackoffScheduler,
    cancel: &CancellationToken,
    mut operation: F,
) -> (Result<T>, RetryStats)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut stats = RetryStats::default();
    let mut state = scheduler.start();

    loop {
        if let Err(e) = cancel.check() {
            return (Err(e), stats);
        }
        stats.attempts += 1;

        let err = match operation().await {
            Ok(value) => {
                stats.success = true;
                if stats.attempts > 1 {
                    debug!("Operation succeeded after {} attempts", stats.attempts);
                }
                return (Ok(value), stats);
            }
            Err(e) => e,
        };
        stats.last_error = Some(err.to_string());

        let classified = match err {
            BulwarkError::Request(classified) if classified.retryable => classified,
            other => {
                debug!("Error is not retryable: {}", other);
                return (Err(other), stats);
            }
        };

        match scheduler.wait(&mut state, classified.retry_after, cancel).await {
            Ok(Some(delay)) => {
                stats.total_delay += delay;
                warn!(
                    "Attempt {}/{} failed: {}. Retried after {:?}",
                    stats.attempts,
                    scheduler.config().max_attempts + 1,
                    classified,
                    delay
                );
            }
            Ok(None) => {
                warn!(
                    "All {} retries exhausted. Last error: {}",
                    scheduler.config().max_attempts,
                    classified
                );
                return (
                    Err(BulwarkError::RetriesExhausted {
                        attempts: stats.attempts,
                        last: classified,
                    }),
                    stats,
                );
            }
            Err(cancelled) => return (Err(cancelled), stats),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::classify::{classify, RawError};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn server_error() -> BulwarkError {
        classify(RawError::status(500, "boom")).into()
    }

    fn no_jitter(base_ms: u64) -> BackoffScheduler {
        BackoffScheduler::new(
            RetryConfig::new()
                .with_base_delay(Duration::from_millis(base_ms))
                .with_jitter_window(Duration::ZERO),
        )
    }

    #[test]
    fn test_delay_doubles_per_retry() {
        let scheduler = no_jitter(1000);
        let mut state = scheduler.start();

        state.attempt = 1;
        assert_eq!(scheduler.next_delay(&state), Some(Duration::from_secs(2)));
        state.attempt = 2;
        assert_eq!(scheduler.next_delay(&state), Some(Duration::from_secs(4)));
        state.attempt = 3;
        assert_eq!(scheduler.next_delay(&state), Some(Duration::from_secs(8)));
    }

    #[test]
    fn test_exhausted_after_max_attempts() {
        let scheduler = no_jitter(1000);
        let mut state = scheduler.start();
        state.attempt = 4;
        assert!(state.is_exhausted());
        assert_eq!(scheduler.next_delay(&state), None);
    }

    #[test]
    fn test_delay_capped_at_max() {
        let scheduler = BackoffScheduler::new(
            RetryConfig::new()
                .with_max_attempts(10)
                .with_base_delay(Duration::from_secs(10))
                .with_max_delay(Duration::from_secs(30))
                .with_jitter_window(Duration::ZERO),
        );
        let mut state = scheduler.start();
        state.attempt = 3;
        assert_eq!(scheduler.next_delay(&state), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_jitter_stays_in_window() {
        let scheduler = BackoffScheduler::default();
        let mut state = scheduler.start();
        for attempt in 0..=3 {
            state.attempt = attempt;
            let base = scheduler.base_delay_for(&state);
            for _ in 0..20 {
                let delay = scheduler.next_delay(&state).unwrap();
                assert!(
                    delay >= base && delay <= base + Duration::from_secs(1),
                    "Delay {:?} outside [{:?}, {:?}]",
                    delay,
                    base,
                    base + Duration::from_secs(1)
                );
            }
        }
    }

    #[test]
    fn test_base_delay_non_decreasing() {
        let scheduler = BackoffScheduler::default();
        let mut state = scheduler.start();
        let mut previous = Duration::ZERO;
        for attempt in 0..=3 {
            state.attempt = attempt;
            let base = scheduler.base_delay_for(&state);
            assert!(base >= previous);
            previous = base;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_first_try() {
        let scheduler = BackoffScheduler::default();
        let (result, stats) =
            retry_async(&scheduler, &CancellationToken::new(), || async { Ok(42) }).await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(stats.attempts, 1);
        assert!(stats.success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_failures() {
        let scheduler = no_jitter(10);
        let counter = Arc::new(AtomicU32::new(0));

        let (result, stats) = retry_async(&scheduler, &CancellationToken::new(), || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(server_error())
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(stats.attempts, 3);
        assert_eq!(stats.total_delay, Duration::from_millis(20 + 40));
        assert!(stats.success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausted() {
        let scheduler = no_jitter(10);
        let counter = Arc::new(AtomicU32::new(0));

        let (result, stats) = retry_async(&scheduler, &CancellationToken::new(), || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<i32, _>(server_error()) }
        })
        .await;

        assert_eq!(counter.load(Ordering::SeqCst), 4);
        assert_eq!(stats.attempts, 4);
        assert!(!stats.success);
        match result {
            Err(BulwarkError::RetriesExhausted { attempts, last }) => {
                assert_eq!(attempts, 4);
                assert_eq!(last.code, 500);
            }
            other => panic!("expected RetriesExhausted, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_non_retryable_error() {
        let scheduler = no_jitter(10);
        let (result, stats) = retry_async(&scheduler, &CancellationToken::new(), || async {
            Err::<i32, _>(classify(RawError::status(404, "gone")).into())
        })
        .await;

        assert!(matches!(result, Err(BulwarkError::Request(ref c)) if c.code == 404));
        assert_eq!(stats.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_raises_delay() {
        let scheduler = no_jitter(10);
        let counter = Arc::new(AtomicU32::new(0));

        let (result, stats) = retry_async(&scheduler, &CancellationToken::new(), || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(classify(
                        RawError::status(429, "slow down").with_retry_after(Duration::from_secs(5)),
                    )
                    .into())
                } else {
                    Ok("ok")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(stats.total_delay, Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_clamped_to_max_delay() {
        let scheduler = BackoffScheduler::new(
            RetryConfig::new()
                .with_base_delay(Duration::from_millis(10))
                .with_jitter_window(Duration::ZERO)
                .with_max_delay(Duration::from_secs(10)),
        );
        let mut state = scheduler.start();

        let delay = scheduler
            .wait(
                &mut state,
                Some(Duration::from_secs(3600)),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(delay, Some(Duration::from_secs(10)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_wait() {
        let scheduler = no_jitter(60_000);
        let cancel = CancellationToken::new();
        let counter = Arc::new(AtomicU32::new(0));

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                cancel.cancel();
            })
        };

        let (result, stats) = retry_async(&scheduler, &cancel, || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<i32, _>(server_error()) }
        })
        .await;
        canceller.await.unwrap();

        assert!(matches!(result, Err(BulwarkError::Cancelled)));
        assert_eq!(stats.attempts, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
