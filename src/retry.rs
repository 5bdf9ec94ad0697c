use std::future::Future;
use std::time::Duration;

use crate::errors::{AppError, FailureClass};

/// Attempt budget and delays for one unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for each further attempt.
    pub base_delay: Duration,
    /// Upper bound for the exponential delay.
    pub max_delay: Duration,
    /// Fixed wait after a 429.
    pub rate_limit_cooldown: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            rate_limit_cooldown: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Self::default()
        }
    }

    /// A single attempt, no retries.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn with_rate_limit_cooldown(mut self, cooldown: Duration) -> Self {
        self.rate_limit_cooldown = cooldown;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// `base_delay * 2^(attempt-1)`, capped at `max_delay`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Delay to wait after `attempt` failed with `err`, or `None` when the error must not be retried.
    pub fn delay_after(&self, err: &AppError, attempt: u32) -> Option<Duration> {
        match err.classify() {
            FailureClass::RateLimited => Some(self.rate_limit_cooldown),
            FailureClass::Retryable => Some(self.backoff_delay(attempt)),
            FailureClass::Permanent => None,
        }
    }

    fn attempt_budget(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Terminal result of a retried operation and how many attempts it took.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, AppError>,
    pub attempts: u32,
}

/// Runs `op` until it succeeds, fails permanently, or the attempt budget is spent.
///
/// `op` receives the 1-based attempt number. Transient failures never escape;
/// only the last error is returned once the budget runs out.
pub async fn execute_with_retry<T, F, Fut>(
    label: &str,
    policy: &RetryPolicy,
    mut op: F,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let budget = policy.attempt_budget();
    let mut attempt = 1;

    loop {
        let err = match op(attempt).await {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt,
                }
            }
            Err(err) => err,
        };

        let delay = match policy.delay_after(&err, attempt) {
            Some(delay) if attempt < budget => delay,
            Some(_) => {
                tracing::error!(
                    key = label,
                    attempts = attempt,
                    "Giving up after exhausting retries: {}",
                    err
                );
                return RetryOutcome {
                    result: Err(err),
                    attempts: attempt,
                };
            }
            None => {
                tracing::warn!(key = label, attempt, "Non-retryable failure: {}", err);
                return RetryOutcome {
                    result: Err(err),
                    attempts: attempt,
                };
            }
        };

        tracing::warn!(
            key = label,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Retryable failure, backing off: {}",
            err
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
