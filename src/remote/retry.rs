use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::Error;
use crate::types::Result;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// How often, and how patiently, a call is retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Read-only calls: bounded exponential backoff
    pub fn read_only(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: MAX_BACKOFF,
        }
    }

    /// Mutating calls: a single retry at most
    pub fn mutating(base_delay: Duration) -> Self {
        Self {
            max_attempts: 2,
            base_delay,
            max_delay: MAX_BACKOFF,
        }
    }

    /// Delay after the `failed_attempts`-th failure
    pub fn backoff(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

/// Classification of one failed attempt
#[derive(Debug)]
pub enum Attempt {
    /// Worth trying again
    Retry(Error),
    /// Give up immediately
    Abort(Error),
}

/// Run `call` until it succeeds, aborts, or the policy is exhausted
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, Attempt>>,
{
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(Attempt::Abort(err)) => return Err(err),
            Err(Attempt::Retry(err)) if attempt >= policy.max_attempts => {
                warn!(operation, attempts = attempt, error = %err, "Giving up after transient failures");
                return Err(err);
            }
            Err(Attempt::Retry(err)) => {
                let delay = policy.backoff(attempt);
                warn!(
                    operation,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
