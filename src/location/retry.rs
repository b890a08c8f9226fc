//! Bounded exponential backoff around provider calls.

use super::types::{GeocodeError, NormalizedKey, ProviderError};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Retry bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Extra random delay as a fraction of the computed backoff (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            jitter: 0.2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    GiveUp,
}

impl RetryPolicy {
    /// Backoff after `attempt` failed attempts, before jitter: base * 2^(attempt-1), capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Decide what to do after `attempt` attempts, the last failing with `error`.
    pub fn decide(&self, error: &ProviderError, attempt: u32) -> RetryDecision {
        if !error.is_retryable() || attempt >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        let delay = self.backoff(attempt);
        match error {
            ProviderError::RateLimited {
                retry_after: Some(hint),
            } => RetryDecision::Retry(delay.max(*hint)),
            _ => RetryDecision::Retry(delay),
        }
    }

    fn with_jitter(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0.0..=self.jitter.min(1.0));
        delay + delay.mul_f64(extra)
    }
}

/// Runs provider attempts under a `RetryPolicy`.
#[derive(Debug, Clone, Default)]
pub struct RetryController {
    policy: RetryPolicy,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `attempt_fn` until it succeeds, fails terminally, or attempts run out.
    ///
    /// The closure receives the 1-based attempt number. An outer `Err` aborts
    /// the loop unchanged (e.g. a rate limiter timeout); an inner `Err` is a
    /// provider classification fed to [`RetryPolicy::decide`].
    pub async fn run<T, F, Fut>(&self, key: &NormalizedKey, mut attempt_fn: F) -> Result<T, GeocodeError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<Result<T, ProviderError>, GeocodeError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match attempt_fn(attempt).await? {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            match self.policy.decide(&error, attempt) {
                RetryDecision::Retry(delay) => {
                    let delay = self.policy.with_jitter(delay);
                    tracing::warn!(%key, attempt, ?delay, %error, "provider attempt failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp => {
                    return Err(match error {
                        ProviderError::NotFound => GeocodeError::NotFound(key.to_string()),
                        ProviderError::Fatal(reason) => GeocodeError::Fatal(reason),
                        last => GeocodeError::ResolutionFailed { attempts: attempt, last },
                    });
                }
            }
        }
    }
}
