//! Bounded retries for REST calls.
//!
//! The stream client has its own reconnect policy; this helper only covers
//! short request/response exchanges such as fetching the unread count.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Retry budget with a linearly growing pause between attempts.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts including the first attempt.
    pub max_attempts: usize,
    /// Pause after the first failed attempt; later pauses are multiples of it.
    pub backoff: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: usize, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// Single attempt, no retries.
    pub const fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Pause before the attempt following failed attempt `attempt` (1-based).
    pub fn delay_after(&self, attempt: usize) -> Duration {
        let factor = u32::try_from(attempt.max(1)).unwrap_or(u32::MAX);
        self.backoff.saturating_mul(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(200))
    }
}

/// Runs `op` until it succeeds, `should_retry` rejects the error, or the
/// attempt budget is spent.
///
/// `op` receives the 1-based attempt number.
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
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt >= max_attempts || !should_retry(&error) {
                    return Err(error);
                }

                let delay = policy.delay_after(attempt);
                debug!(
                    event = "request_attempt_failed",
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::time::Instant;

    use super::{retry_async, RetryPolicy};

    #[tokio::test(start_paused = true)]
    async fn retries_until_success_with_linear_pauses() {
        let calls = Arc::new(AtomicUsize::new(0));
        let policy = RetryPolicy::new(4, Duration::from_millis(100));
        let started = Instant::now();

        let result = retry_async(
            &policy,
            |_| {
                let calls = Arc::clone(&calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("unavailable")
                    } else {
                        Ok(7u64)
                    }
                }
            },
            |_| true,
        )
        .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_retry_predicate_rejects() {
        let calls = Arc::new(AtomicUsize::new(0));

        let result: Result<(), &str> = retry_async(
            &RetryPolicy::default(),
            |_| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("forbidden")
                }
            },
            |_| false,
        )
        .await;

        assert_eq!(result, Err("forbidden"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_the_attempt_budget() {
        let attempts_seen = Arc::new(std::sync::Mutex::new(Vec::new()));

        let result: Result<(), &str> = retry_async(
            &RetryPolicy::new(3, Duration::from_millis(10)),
            |attempt| {
                let attempts_seen = Arc::clone(&attempts_seen);
                async move {
                    attempts_seen.lock().unwrap().push(attempt);
                    Err("timeout")
                }
            },
            |_| true,
        )
        .await;

        assert_eq!(result, Err("timeout"));
        assert_eq!(*attempts_seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn none_policy_has_zero_delay() {
        let policy = RetryPolicy::none();
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.delay_after(5), Duration::ZERO);
    }
}
