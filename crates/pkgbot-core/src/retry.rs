use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Bounded retry with linear backoff. Only errors the caller classifies as
/// retryable are retried; everything else is returned on the first failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// A single retry with no delay.
    pub const fn once() -> Self {
        Self::new(2, Duration::ZERO)
    }

    /// Runs `op` (given the 1-based attempt number) until it succeeds, fails
    /// with a non-retryable error, or attempts are exhausted. `before_retry`
    /// runs with the failed attempt number ahead of the next attempt.
    pub async fn run<T, E, Op, Fut, Classify, Hook, HookFut>(
        &self,
        label: &str,
        mut op: Op,
        retryable: Classify,
        mut before_retry: Hook,
    ) -> Result<T, E>
    where
        E: Display,
        Op: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        Classify: Fn(&E) -> bool,
        Hook: FnMut(u32) -> HookFut,
        HookFut: Future<Output = ()>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < max_attempts && retryable(&err) => {
                    warn!(
                        target: "pkgbot::retry",
                        op = label,
                        attempt,
                        max_attempts,
                        error = %err,
                        "retryable failure"
                    );
                    before_retry(attempt).await;
                    let delay = self.backoff.saturating_mul(attempt);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
