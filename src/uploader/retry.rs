use rand::Rng;
use std::future::Future;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

use crate::errors::{AppError, AppResult};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    /// Fraction of each delay added or removed at random.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter: 0.2,
        }
    }
}

/// Result of one attempt, classified before the loop decides what to do.
#[derive(Debug)]
pub enum Attempt<T> {
    Success(T),
    Retryable(AppError),
    Terminal(AppError),
}

impl<T> Attempt<T> {
    pub fn classify<C>(result: AppResult<T>, is_retryable: C) -> Self
    where
        C: Fn(&AppError) -> bool,
    {
        match result {
            Ok(value) => Attempt::Success(value),
            Err(e) if is_retryable(&e) => Attempt::Retryable(e),
            Err(e) => Attempt::Terminal(e),
        }
    }
}

/// Bounded exponential backoff with jitter around a fallible async call.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay after the `attempt`-th failure (1-based), before jitter.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let delay_ms = self.config.base_delay.as_millis() as f64
            * self
                .config
                .exponential_base
                .powi(attempt.saturating_sub(1) as i32);

        let delay = Duration::from_millis(delay_ms.min(u64::MAX as f64) as u64);
        delay.min(self.config.max_delay)
    }

    fn with_jitter(&self, delay: Duration) -> Duration {
        let spread = self.config.jitter.clamp(0.0, 1.0);
        if spread == 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = rand::rng().random_range((1.0 - spread)..=(1.0 + spread));
        delay.mul_f64(factor)
    }

    fn delay_for(&self, attempt: u32, error: &AppError) -> Duration {
        match error.retry_after_ms() {
            Some(hint) => Duration::from_millis(hint).min(self.config.max_delay),
            None => self.with_jitter(self.backoff_delay(attempt)),
        }
    }

    /// Runs `operation` using [`AppError::is_retryable`] to classify failures.
    pub async fn execute<T, F, Fut>(&self, operation: F, cancel: &CancellationToken) -> AppResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        self.execute_with(operation, AppError::is_retryable, cancel)
            .await
    }

    pub async fn execute_with<T, F, Fut, C>(
        &self,
        mut operation: F,
        is_retryable: C,
        cancel: &CancellationToken,
    ) -> AppResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AppResult<T>>,
        C: Fn(&AppError) -> bool,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(AppError::cancelled("request"));
            }

            attempt += 1;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AppError::cancelled("request")),
                result = operation() => result,
            };

            match Attempt::classify(result, &is_retryable) {
                Attempt::Success(value) => {
                    if attempt > 1 {
                        log::info!("Request succeeded on attempt {}", attempt);
                    }
                    return Ok(value);
                }
                Attempt::Terminal(error) => return Err(error),
                Attempt::Retryable(error) if attempt >= max_attempts => {
                    log::error!("Giving up after {} attempts: {}", attempt, error);
                    return Err(AppError::RetriesExhausted {
                        attempts: attempt,
                        last: Box::new(error),
                    });
                }
                Attempt::Retryable(error) => {
                    let delay = self.delay_for(attempt, &error);
                    log::warn!(
                        "Attempt {} of {} failed, retrying in {:?}: {}",
                        attempt,
                        max_attempts,
                        delay,
                        error
                    );

                    tokio::select! {
                        _ = cancel.cancelled() => return Err(AppError::cancelled("retry backoff")),
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            ..RetryConfig::default()
        })
    }

    fn transient() -> AppError {
        AppError::Server {
            status: 503,
            message: "unavailable".into(),
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_failures_with_exact_attempts() {
        for n in 1..=5u32 {
            let calls = AtomicU32::new(0);
            let result = fast_policy(5)
                .execute(
                    || async {
                        let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                        if call < n {
                            Err(transient())
                        } else {
                            Ok(call)
                        }
                    },
                    &CancellationToken::new(),
                )
                .await;

            assert_eq!(result.unwrap(), n);
            assert_eq!(calls.load(Ordering::SeqCst), n);
        }
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: AppResult<()> = fast_policy(4)
            .execute(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(transient())
                },
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match result {
            Err(AppError::RetriesExhausted { attempts, last }) => {
                assert_eq!(attempts, 4);
                assert!(matches!(*last, AppError::Server { status: 503, .. }));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_terminal_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: AppResult<()> = fast_policy(5)
            .execute(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(AppError::Auth {
                        message: "invalid credentials".into(),
                    })
                },
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(AppError::Auth { .. })));
    }

    #[tokio::test]
    async fn test_missing_local_file_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: AppResult<()> = fast_policy(5)
            .execute(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(AppError::Io(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "thumb.jpg",
                    )))
                },
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(AppError::Io(_))));
    }

    #[tokio::test]
    async fn test_custom_classifier() {
        let calls = AtomicU32::new(0);
        let result: AppResult<()> = fast_policy(3)
            .execute_with(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(transient())
                },
                |_| false,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(AppError::Server { .. })));
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_backoff() {
        let policy = RetryPolicy::new(RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(60),
            ..RetryConfig::default()
        });
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();
        let result: AppResult<()> = policy
            .execute(
                || {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err(transient())
                    }
                },
                &cancel,
            )
            .await;

        assert!(matches!(result, Err(AppError::Cancelled { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_schedule_is_exponential_and_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(2));
        assert_eq!(policy.backoff_delay(3), Duration::from_secs(4));
        assert_eq!(policy.backoff_delay(7), Duration::from_secs(60));
        assert_eq!(policy.backoff_delay(40), Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_stays_within_twenty_percent() {
        let policy = RetryPolicy::default();
        for _ in 0..200 {
            let delay = policy.with_jitter(Duration::from_secs(10));
            assert!(delay >= Duration::from_secs(8), "{:?}", delay);
            assert!(delay <= Duration::from_secs(12), "{:?}", delay);
        }
    }

    #[test]
    fn test_rate_limit_hint_replaces_backoff() {
        let policy = RetryPolicy::default();
        let hinted = policy.delay_for(
            1,
            &AppError::RateLimit {
                retry_after_ms: 7000,
            },
        );
        assert_eq!(hinted, Duration::from_secs(7));

        let capped = policy.delay_for(
            1,
            &AppError::RateLimit {
                retry_after_ms: 600_000,
            },
        );
        assert_eq!(capped, Duration::from_secs(60));
    }
}
