use std::future::Future;
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Exponential backoff for transport failures.
///
/// The wait doubles after every failed attempt, up to `max_wait`.  A rate
/// limit response waits `rate_limit_wait` instead.  Errors that are not
/// retryable are returned after the first attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_wait: Duration,
    pub max_wait: Duration,
    pub rate_limit_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            initial_wait: Duration::from_millis(500),
            max_wait: Duration::from_secs(30),
            rate_limit_wait: Duration::from_secs(60),
        }
    }
}

/// The last error, once the policy gave up.
#[derive(Debug)]
pub struct Exhausted {
    pub error: Error,
    pub attempts: u32,
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        }
    }

    /// Wait before attempt `attempt + 1`, after `attempt` failures.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_wait
            .checked_mul(factor)
            .unwrap_or(self.max_wait)
            .min(self.max_wait)
    }

    /// Run `op` until it succeeds, fails with an error that is not retryable,
    /// or `max_attempts` is reached.  Returns the value and the number of
    /// attempts it took.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<(T, u32), Exhausted>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match op().await {
                Ok(value) => return Ok((value, attempts)),
                Err(error) => {
                    if !error.is_retryable() || attempts >= self.max_attempts.max(1) {
                        return Err(Exhausted { error, attempts });
                    }
                    let wait = if error.is_rate_limited() {
                        self.rate_limit_wait
                    } else {
                        self.backoff(attempts)
                    };
                    warn!(
                        "{} failed: {} (attempt {}/{}), retrying in {:?}",
                        what, error, attempts, self.max_attempts, wait
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}
