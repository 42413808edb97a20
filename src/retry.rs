//! Bounded retry with exponential backoff for provider calls.
//!
//! Both provider calls a turn makes are reads with no side effects on the
//! provider, so repeating them is always safe.  Only errors that
//! [`Error::is_retryable`] are repeated.

use std::future::Future;
use std::time::Duration;

use crate::error::{Error, ProviderFailure, Result};
use crate::observability::{RETRIES, RETRY_BACKOFF};

const DEFAULT_MAX_RETRIES: u32 = 2;
const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(8);

/// Which provider call a retry policy is guarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// The vector-search call.
    Retrieval,
    /// The chat-completion call.
    Completion,
}

impl Stage {
    fn timeout_error(self, timeout: Duration) -> Error {
        let message = format!("no response within {:.1} seconds", timeout.as_secs_f64());
        match self {
            Stage::Retrieval => Error::retrieval(ProviderFailure::Timeout, message, None),
            Stage::Completion => Error::completion(ProviderFailure::Timeout, message, None),
        }
    }
}

/// How often and how patiently to repeat a failed provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Re-attempts after the first try.  Zero disables retrying.
    pub max_retries: u32,
    /// Delay before the first re-attempt; doubles after each.
    pub initial_backoff: Duration,
    /// Upper bound on any single delay, including provider `retry-after` hints.
    pub max_backoff: Duration,
    /// Deadline for each individual attempt.
    pub attempt_timeout: Option<Duration>,
}

impl RetryPolicy {
    /// Creates the default policy: two retries starting at half a second.
    pub fn new() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            attempt_timeout: None,
        }
    }

    /// A policy that tries exactly once.
    pub fn none() -> Self {
        Self::new().with_max_retries(0)
    }

    /// Sets the number of re-attempts.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the initial and maximum backoff.
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    /// Sets the per-attempt deadline.
    pub fn with_attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// The delay before re-attempt number `retry` (1-based).
    pub fn backoff(&self, retry: u32, error: &Error) -> Duration {
        if let Some(seconds) = error.retry_after() {
            return Duration::from_secs(seconds).min(self.max_backoff);
        }
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Runs `op` until it succeeds, fails permanently, or retries run out.
    pub async fn run<T, F, Fut>(&self, stage: Stage, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retry = 0;
        loop {
            let outcome = match self.attempt_timeout {
                Some(timeout) => match tokio::time::timeout(timeout, op()).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(stage.timeout_error(timeout)),
                },
                None => op().await,
            };
            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !err.is_retryable() || retry >= self.max_retries {
                return Err(err);
            }
            retry += 1;
            let delay = self.backoff(retry, &err);
            RETRIES.click();
            RETRY_BACKOFF.add(delay.as_secs_f64());
            tracing::warn!(
                ?stage,
                retry,
                max_retries = self.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "provider call failed; retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_doubles_and_caps() {
        let policy =
            RetryPolicy::new().with_backoff(Duration::from_secs(1), Duration::from_secs(5));
        let err = Error::completion(ProviderFailure::Server, "boom", None);
        assert_eq!(policy.backoff(1, &err), Duration::from_secs(1));
        assert_eq!(policy.backoff(2, &err), Duration::from_secs(2));
        assert_eq!(policy.backoff(3, &err), Duration::from_secs(4));
        assert_eq!(policy.backoff(4, &err), Duration::from_secs(5));
    }

    #[test]
    fn retry_after_hint_wins_but_is_capped() {
        let policy =
            RetryPolicy::new().with_backoff(Duration::from_secs(1), Duration::from_secs(5));
        let err =
            Error::completion(ProviderFailure::RateLimit, "slow", None).with_retry_after(Some(3));
        assert_eq!(policy.backoff(1, &err), Duration::from_secs(3));
        let err =
            Error::completion(ProviderFailure::RateLimit, "slow", None).with_retry_after(Some(60));
        assert_eq!(policy.backoff(1, &err), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_until_success() {
        let calls = &AtomicU32::new(0);
        let policy = RetryPolicy::new().with_max_retries(3);
        let value = policy
            .run(Stage::Retrieval, move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::retrieval(ProviderFailure::Connection, "reset", None))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_are_bounded() {
        let calls = &AtomicU32::new(0);
        let policy = RetryPolicy::new().with_max_retries(2);
        let err = policy
            .run(Stage::Completion, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::completion(ProviderFailure::Server, "down", None))
            })
            .await
            .unwrap_err();
        assert!(err.is_completion());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let calls = &AtomicU32::new(0);
        let policy = RetryPolicy::new().with_max_retries(5);
        let err = policy
            .run(Stage::Completion, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::completion(ProviderFailure::Authentication, "bad key", None))
            })
            .await
            .unwrap_err();
        assert_eq!(err.provider_failure(), Some(ProviderFailure::Authentication));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_attempts_time_out() {
        let policy = RetryPolicy::none().with_attempt_timeout(Some(Duration::from_secs(2)));
        let err = policy
            .run(Stage::Retrieval, || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(err.is_retrieval());
        assert!(err.is_timeout());
    }
}
