use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Returned when every allowed attempt failed.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RetryError<E> {
    /// The attempt budget was consumed; `last` is the final observed error.
    #[error("gave up after {attempts} attempt(s): {last}")]
    Exhausted { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } => *attempts,
        }
    }

    pub fn into_last(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } => last,
        }
    }

    pub fn last(&self) -> &E {
        match self {
            RetryError::Exhausted { last, .. } => last,
        }
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Capped exponential backoff without jitter.
///
/// The delay before attempt `k` (1-based, `k >= 2`) is
/// `min(base_delay * 2^(k-2), max_delay)`; attempt 1 runs immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Attempt budget, never less than one.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay to wait before `attempt` (1-based). Zero for the first attempt.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt < 2 {
            return Duration::ZERO;
        }
        // Saturate rather than overflow for large attempt numbers.
        let multiplier = 2u32.checked_pow(attempt - 2).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// The full delay schedule `d_2 ..= d_max_attempts`.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (2..=self.attempts()).map(move |k| self.delay_before(k))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), Duration::from_secs(30))
    }
}

/// A successful value together with how many attempts it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
}

// ---------------------------------------------------------------------------
// retry
// ---------------------------------------------------------------------------

/// Run `operation` until it succeeds or the policy's attempt budget is spent.
///
/// The first success is returned immediately. Waiting between attempts is a
/// tokio sleep, so dropping the returned future cancels any pending wait.
pub async fn retry<F, Fut, T, E>(
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<Retried<T>, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let budget = policy.attempts();
    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "operation succeeded after retry");
                }
                return Ok(Retried {
                    value,
                    attempts: attempt,
                });
            }
            Err(e) if attempt >= budget => {
                warn!(attempt, budget, error = %e, "retry budget exhausted");
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: e,
                });
            }
            Err(e) => {
                let delay = policy.delay_before(attempt + 1);
                warn!(
                    attempt,
                    budget,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "attempt failed, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
