//! Bounded exponential-backoff retry.
//!
//! [`BackoffPolicy`] is the single retry primitive used by the worker: the
//! startup readiness wait polls the engine under [`BackoffPolicy::startup`],
//! while the per-request liveness check runs under
//! [`BackoffPolicy::single_attempt`] so that it fails fast.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

/// Tunable parameters for bounded exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Overall time budget, measured from the first attempt.
    pub deadline: Option<Duration>,
    /// Maximum number of attempts, including the first.
    pub max_attempts: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::startup()
    }
}

impl BackoffPolicy {
    /// Policy used while waiting for a freshly launched engine to answer.
    pub fn startup() -> Self {
        Self {
            initial_delay: Duration::from_millis(300),
            multiplier: 1.5,
            max_delay: Duration::from_secs(5),
            deadline: Some(Duration::from_secs(60)),
            max_attempts: None,
        }
    }

    /// Exactly one attempt, never sleeps.
    pub fn single_attempt() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
            deadline: None,
            max_attempts: Some(1),
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Calculate the delay that follows `current`, clamped to `max_delay`.
    pub fn next_delay(&self, current: Duration) -> Duration {
        let next_ms = (current.as_millis() as f64 * self.multiplier) as u64;
        Duration::from_millis(next_ms).min(self.max_delay)
    }

    /// Run `op` until it succeeds or the policy is exhausted.
    ///
    /// `op` receives the 1-based attempt number. The policy gives up when the
    /// attempt cap is reached, or when sleeping for the next delay would
    /// overrun the deadline.
    pub async fn retry<T, E, F, Fut>(&self, mut op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        let mut delay = self.initial_delay;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if self.max_attempts.is_some_and(|max| attempt >= max) {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last_error: err,
                });
            }

            if let Some(deadline) = self.deadline {
                if started.elapsed() + delay > deadline {
                    return Err(RetryError::DeadlineExceeded {
                        attempts: attempt,
                        elapsed: started.elapsed(),
                        last_error: err,
                    });
                }
            }

            tracing::debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Attempt failed, backing off",
            );
            tokio::time::sleep(delay).await;
            delay = self.next_delay(delay);
        }
    }
}

/// Why [`BackoffPolicy::retry`] gave up.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempt(s): {last_error}")]
    Exhausted { attempts: u32, last_error: E },

    #[error("deadline exceeded after {attempts} attempt(s) in {elapsed:?}: {last_error}")]
    DeadlineExceeded {
        attempts: u32,
        elapsed: Duration,
        last_error: E,
    },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } | Self::DeadlineExceeded { attempts, .. } => *attempts,
        }
    }

    pub fn into_last_error(self) -> E {
        match self {
            Self::Exhausted { last_error, .. } | Self::DeadlineExceeded { last_error, .. } => {
                last_error
            }
        }
    }
}
