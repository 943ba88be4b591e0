//! Rate limiter with exponential backoff for upstream calls
//!
//! Every upstream call waits for the current inter-call delay first. When the
//! upstream signals a rate limit the delay grows geometrically up to a cap and
//! the call is retried; any success brings the delay back to its base value.

use crate::config::RateLimitConfig;
use crate::error::{RetryableError, SyncError};
use rand::Rng;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Observable backoff state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterState {
    /// Delay applied before the next call
    pub current_delay: Duration,
    /// Attempts made by the call in progress, 0 when idle
    pub attempt_count: u32,
}

/// Throttles and retries upstream calls
///
/// The limiter is shared by every synchronizer that talks to the same
/// upstream so that backoff triggered by one job slows down the next.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    state: Mutex<RateLimiterState>,
}

impl RateLimiter {
    /// Create a new RateLimiter with the given configuration
    pub fn new(config: RateLimitConfig) -> Self {
        let state = RateLimiterState {
            current_delay: config.api_delay(),
            attempt_count: 0,
        };
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    /// Create a RateLimiter with default configuration
    pub fn with_defaults() -> Self {
        Self::new(RateLimitConfig::default())
    }

    /// Snapshot of the current backoff state
    pub fn state(&self) -> RateLimiterState {
        *self.lock_state()
    }

    /// Sleep for the current inter-call delay
    ///
    /// Returns `SyncError::Cancelled` as soon as the token fires.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), SyncError> {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let delay = self.sleep_duration(self.lock_state().current_delay);
        if delay.is_zero() {
            return Ok(());
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SyncError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Execute an async operation with throttling and retry
    ///
    /// Rate-limit errors are retried with a growing delay up to
    /// `max_attempts` total attempts; any other error is returned as is after
    /// the first attempt. An operation already in flight is never interrupted
    /// by cancellation, but no further attempt is started once the token fires.
    pub async fn execute_with_retry<F, Fut, T>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            if let Err(err) = self.wait(cancel).await {
                self.lock_state().attempt_count = 0;
                return Err(err);
            }

            attempt += 1;
            self.lock_state().attempt_count = attempt;

            match operation().await {
                Ok(result) => {
                    self.reset();
                    return Ok(result);
                }
                Err(err) if !err.is_retryable() => {
                    self.lock_state().attempt_count = 0;
                    return Err(err);
                }
                Err(err) => {
                    let next_delay = self.back_off(err.retry_after());

                    if attempt >= max_attempts {
                        warn!(
                            attempts = attempt,
                            max_attempts,
                            error = %err,
                            "Max attempts exhausted"
                        );
                        self.lock_state().attempt_count = 0;
                        return Err(SyncError::RetriesExhausted {
                            attempts: attempt,
                            last: Box::new(err),
                        });
                    }

                    debug!(
                        attempt,
                        max_attempts,
                        delay_ms = next_delay.as_millis() as u64,
                        error = %err,
                        "Rate limited, backing off"
                    );
                }
            }
        }
    }

    /// Grow the delay after a rate-limited attempt and return the new value
    fn back_off(&self, retry_after: Option<Duration>) -> Duration {
        let max_delay = self.config.max_delay();
        let mut state = self.lock_state();
        let grown = Duration::try_from_secs_f64(
            state.current_delay.as_secs_f64() * self.config.backoff_multiplier.max(1.0),
        )
        .unwrap_or(max_delay);
        let hinted = retry_after.map_or(grown, |hint| grown.max(hint));
        state.current_delay = hinted.min(max_delay);
        state.current_delay
    }

    fn reset(&self) {
        let mut state = self.lock_state();
        state.current_delay = self.config.api_delay();
        state.attempt_count = 0;
    }

    /// Apply jitter: 50-100% of the delay
    fn sleep_duration(&self, delay: Duration) -> Duration {
        if self.config.jitter && !delay.is_zero() {
            delay.mul_f64(rand::thread_rng().gen_range(0.5..1.0))
        } else {
            delay
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RateLimiterState> {
        // The state is plain data; a poisoned lock still holds a usable value
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn config(max_attempts: u32) -> RateLimitConfig {
        RateLimitConfig {
            api_delay_ms: 100,
            backoff_multiplier: 2.0,
            max_delay_ms: 1_000,
            max_attempts,
            jitter: false,
        }
    }

    // Test 1: Success on first attempt returns immediately
    #[tokio::test(start_paused = true)]
    async fn test_success_on_first_attempt() {
        let limiter = RateLimiter::new(config(3));
        let cancel = CancellationToken::new();

        let call_count = Arc::new(AtomicU32::new(0));
        let counter = call_count.clone();

        let result = limiter
            .execute_with_retry(&cancel, || {
                let count = counter.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, SyncError>("success")
                }
            })
            .await;

        assert_eq!(result, Ok("success"));
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }

    // Test 2: Two rate-limited failures then success makes exactly three calls
    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_rate_limit() {
        let limiter = RateLimiter::new(config(3));
        let cancel = CancellationToken::new();

        let attempt_count = Arc::new(AtomicU32::new(0));
        let counter = attempt_count.clone();

        let result = limiter
            .execute_with_retry(&cancel, || {
                let count = counter.clone();
                async move {
                    let current = count.fetch_add(1, Ordering::SeqCst);
                    if current < 2 {
                        Err(SyncError::Network("HTTP 429 Too Many Requests".to_string()))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(7));
        assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
        assert_eq!(
            limiter.state(),
            RateLimiterState {
                current_delay: Duration::from_millis(100),
                attempt_count: 0,
            }
        );
    }

    // Test 3: Always rate limited makes exactly max_attempts calls
    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let limiter = RateLimiter::new(config(4));
        let cancel = CancellationToken::new();

        let attempt_count = Arc::new(AtomicU32::new(0));
        let counter = attempt_count.clone();

        let result: Result<(), SyncError> = limiter
            .execute_with_retry(&cancel, || {
                let count = counter.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Err(SyncError::RateLimited(0))
                }
            })
            .await;

        assert_eq!(attempt_count.load(Ordering::SeqCst), 4);
        assert_eq!(
            result,
            Err(SyncError::RetriesExhausted {
                attempts: 4,
                last: Box::new(SyncError::RateLimited(0)),
            })
        );
        // 100 -> 200 -> 400 -> 800 -> capped at 1000
        assert_eq!(limiter.state().current_delay, Duration::from_millis(1_000));
        assert_eq!(limiter.state().attempt_count, 0);
    }

    // Test 4: Non-retryable errors are returned after one call
    #[tokio::test(start_paused = true)]
    async fn test_no_retry_on_non_retryable_error() {
        let limiter = RateLimiter::new(config(5));
        let cancel = CancellationToken::new();

        let attempt_count = Arc::new(AtomicU32::new(0));
        let counter = attempt_count.clone();

        let result: Result<(), SyncError> = limiter
            .execute_with_retry(&cancel, || {
                let count = counter.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Err(SyncError::ServerError(503))
                }
            })
            .await;

        assert_eq!(result, Err(SyncError::ServerError(503)));
        assert_eq!(attempt_count.load(Ordering::SeqCst), 1);
        assert_eq!(limiter.state().current_delay, Duration::from_millis(100));
    }

    // Test 5: Cancelling during a retry sequence stops further attempts
    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_retries() {
        let limiter = RateLimiter::new(config(10));
        let cancel = CancellationToken::new();

        let attempt_count = Arc::new(AtomicU32::new(0));
        let counter = attempt_count.clone();
        let token = cancel.clone();

        let result: Result<(), SyncError> = limiter
            .execute_with_retry(&cancel, || {
                let count = counter.clone();
                let token = token.clone();
                async move {
                    if count.fetch_add(1, Ordering::SeqCst) == 1 {
                        token.cancel();
                    }
                    Err(SyncError::RateLimited(0))
                }
            })
            .await;

        assert_eq!(result, Err(SyncError::Cancelled));
        assert_eq!(attempt_count.load(Ordering::SeqCst), 2);
    }

    // Test 6: wait returns promptly when cancelled mid-sleep
    #[tokio::test(start_paused = true)]
    async fn test_wait_cancelled_mid_sleep() {
        let limiter = RateLimiter::new(RateLimitConfig {
            api_delay_ms: 60_000,
            ..config(3)
        });
        let cancel = CancellationToken::new();

        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });

        let start = tokio::time::Instant::now();
        assert_eq!(limiter.wait(&cancel).await, Err(SyncError::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(60));
    }

    // Test 7: wait sleeps for the current delay
    #[tokio::test(start_paused = true)]
    async fn test_wait_sleeps_for_delay() {
        let limiter = RateLimiter::new(config(3));
        let cancel = CancellationToken::new();

        let start = tokio::time::Instant::now();
        limiter.wait(&cancel).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    // Test 8: Retry-After hints raise the delay, still capped
    #[tokio::test]
    async fn test_retry_after_hint_raises_delay() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max_delay_ms: 5_000,
            ..config(3)
        });

        assert_eq!(
            limiter.back_off(Some(Duration::from_secs(2))),
            Duration::from_secs(2)
        );
        assert_eq!(
            limiter.back_off(Some(Duration::from_secs(60))),
            Duration::from_secs(5)
        );
    }

    // Test 9: A huge multiplier saturates at the cap instead of overflowing
    #[tokio::test(start_paused = true)]
    async fn test_huge_multiplier_caps_delay() {
        let limiter = RateLimiter::new(RateLimitConfig {
            backoff_multiplier: f64::MAX,
            max_delay_ms: 5_000,
            ..config(3)
        });
        let cancel = CancellationToken::new();

        let result: Result<(), SyncError> = limiter
            .execute_with_retry(&cancel, || async { Err(SyncError::RateLimited(0)) })
            .await;

        assert!(matches!(
            result,
            Err(SyncError::RetriesExhausted { attempts: 3, .. })
        ));
        assert_eq!(limiter.state().current_delay, Duration::from_secs(5));
    }

    // Test 10: Jitter keeps the sleep between 50% and 100% of the delay
    #[test]
    fn test_jitter_range() {
        let limiter = RateLimiter::new(RateLimitConfig {
            jitter: true,
            ..config(3)
        });

        for _ in 0..100 {
            let d = limiter.sleep_duration(Duration::from_millis(1_000));
            assert!(d >= Duration::from_millis(500));
            assert!(d <= Duration::from_millis(1_000));
        }
    }

    // Test 11: Already-cancelled token fails before the first call
    #[tokio::test]
    async fn test_cancelled_before_first_call() {
        let limiter = RateLimiter::with_defaults();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let attempt_count = Arc::new(AtomicU32::new(0));
        let counter = attempt_count.clone();

        let result: Result<(), SyncError> = limiter
            .execute_with_retry(&cancel, || {
                let count = counter.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        assert_eq!(result, Err(SyncError::Cancelled));
        assert_eq!(attempt_count.load(Ordering::SeqCst), 0);
    }
}
