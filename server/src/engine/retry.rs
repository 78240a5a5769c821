use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

/// Maps a retry number (1 for the first retry) to the delay before it.
pub type BackoffFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Bounded retry: at most `max_retries` extra attempts, each preceded by `backoff(retry)`.
#[derive(Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    backoff: BackoffFn,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: BackoffFn) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// Same delay before every retry.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self::new(max_retries, Arc::new(move |_| delay))
    }

    /// Retries without sleeping. Used by tests.
    pub fn immediate(max_retries: u32) -> Self {
        Self::fixed(max_retries, Duration::ZERO)
    }

    /// Capped, jittered exponential backoff for bulk store writes.
    pub fn jittered(max_retries: u32) -> Self {
        Self::new(max_retries, Arc::new(jittered_backoff))
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn delay_for(&self, retry: u32) -> Duration {
        (self.backoff)(retry)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// retry budget is spent. The last error is returned in the latter cases.
    pub async fn run<T, E, F, Fut>(&self, mut op: F, retryable: impl Fn(&E) -> bool) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut retry = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if retry < self.max_retries && retryable(&e) => {
                    retry += 1;
                    let delay = self.delay_for(retry);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// `min(10s, (retry² + U[0, 5)) · 2s)`
pub fn jittered_backoff(retry: u32) -> Duration {
    let jitter: f64 = rand::thread_rng().gen_range(0.0..5.0);
    let secs = (f64::from(retry * retry) + jitter) * 2.0;
    Duration::from_secs_f64(secs.min(10.0))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn test_jittered_backoff_is_capped() {
        for retry in 1..=6 {
            let delay = jittered_backoff(retry);
            assert!(delay <= Duration::from_secs(10), "retry {retry}: {delay:?}");
            assert!(delay >= Duration::from_secs(2), "retry {retry}: {delay:?}");
        }
        assert_eq!(jittered_backoff(3), Duration::from_secs(10));
    }

    #[test]
    fn test_injected_backoff_is_used() {
        let policy = RetryPolicy::new(3, Arc::new(|retry| Duration::from_millis(u64::from(retry) * 100)));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(3), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_run_stops_after_budget() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::immediate(2);
        let result: Result<(), &str> = policy
            .run(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("boom") }
                },
                |_| true,
            )
            .await;
        assert_eq!(result, Err("boom"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_does_not_retry_permanent_errors() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::immediate(5);
        let result: Result<(), &str> = policy
            .run(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("forbidden") }
                },
                |e| *e != "forbidden",
            )
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_returns_first_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::immediate(5);
        let result: Result<u32, &str> = policy
            .run(
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move { if n < 2 { Err("flaky") } else { Ok(n) } }
                },
                |_| true,
            )
            .await;
        assert_eq!(result, Ok(2));
    }
}
