//! crates/session_reliability_core/src/retry.rs
//!
//! Exponential backoff with jitter around a fallible async operation.
//! Only failures classified as retryable are attempted again; once the attempt
//! budget is spent the last failure is wrapped in `RetryExhausted`, which is
//! itself never retryable.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{SessionError, SessionResult};

/// Upper bound of the random jitter added to every backoff delay, in milliseconds.
pub const MAX_JITTER_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// Delay before retrying after failed attempt `attempt` (1-based):
    /// `min(base * 2^(attempt-1) + jitter, max)`.
    pub fn backoff_delay(&self, attempt: u32, jitter: Duration) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let exponential = self.base_delay.saturating_mul(1u32 << exponent);
        exponential.saturating_add(jitter).min(self.max_delay)
    }

    /// Runs `operation` until it succeeds or fails for good.
    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> SessionResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SessionResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "operation recovered after retry");
                    }
                    return Ok(value);
                }
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) if attempt >= self.max_attempts => {
                    warn!(attempts = attempt, error = %err, "retry budget exhausted");
                    return Err(SessionError::RetryExhausted {
                        attempts: attempt,
                        last: Box::new(err),
                    });
                }
                Err(err) => {
                    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=MAX_JITTER_MS));
                    let delay = self.backoff_delay(attempt, jitter);
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retryable failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(10))
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.backoff_delay(1, Duration::ZERO), Duration::from_secs(1));
        assert_eq!(p.backoff_delay(2, Duration::ZERO), Duration::from_secs(2));
        assert_eq!(p.backoff_delay(3, Duration::from_millis(500)), Duration::from_millis(4500));
        assert_eq!(p.backoff_delay(5, Duration::ZERO), Duration::from_secs(10));
        assert_eq!(p.backoff_delay(40, Duration::ZERO), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = policy()
            .execute(|| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(SessionError::Network("offline".into()))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn does_not_retry_permanent_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: SessionResult<()> = policy()
            .execute(|| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(SessionError::Config("missing api key".into()))
                }
            })
            .await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Config);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn wraps_last_error_when_budget_runs_out() {
        let started = tokio::time::Instant::now();
        let result: SessionResult<()> = policy()
            .execute(|| async {
                Err(SessionError::Api {
                    status: 503,
                    message: "overloaded".into(),
                })
            })
            .await;
        let err = result.unwrap_err();
        match &err {
            SessionError::RetryExhausted { attempts, last } => {
                assert_eq!(*attempts, 3);
                assert!(matches!(**last, SessionError::Api { status: 503, .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!err.is_retryable());
        // Two backoffs: at least 1s + 2s, at most (1s + 1s) + (2s + 1s).
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(3), "waited {waited:?}");
        assert!(waited <= Duration::from_secs(5), "waited {waited:?}");
    }
}
