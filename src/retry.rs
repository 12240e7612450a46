//! Retry with exponential backoff for collaborator calls.
//!
//! DESIGN
//! ======
//! The provider client and the profile store own their retry policy; the
//! session manager never retries on its own. Each error type decides whether
//! it is worth another attempt through [`Retryable`]: auth rejections and
//! constraint violations fail fast, transport hiccups are retried.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

pub const DEFAULT_RETRY_MAX: u32 = 3;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1000;

/// Errors that know whether repeating the call could succeed.
pub trait Retryable {
    fn retryable(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self { max_retries, base_delay }
    }

    /// A policy that makes exactly one attempt.
    #[must_use]
    pub fn none() -> Self {
        Self { max_retries: 0, base_delay: Duration::ZERO }
    }

    /// Delay before retry number `attempt` (0-based), without jitter.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_MAX, Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS))
    }
}

/// Up to 10% extra on top of `delay`, so clients that failed together do not
/// retry in lockstep.
fn with_jitter(delay: Duration) -> Duration {
    let max_jitter_ms = u64::try_from(delay.as_millis() / 10).unwrap_or(u64::MAX);
    if max_jitter_ms == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::rng().random_range(0..=max_jitter_ms))
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the policy
/// runs out of attempts. Returns the last error in the latter cases.
pub async fn retry_with_backoff<T, E, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, E>
where
    E: Retryable + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.retryable() || attempt >= policy.max_retries => return Err(e),
            Err(e) => {
                let delay = with_jitter(policy.backoff(attempt));
                debug!(attempt, error = %e, delay_ms = delay.as_millis(), "retrying after backoff");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
#[path = "retry_test.rs"]
mod tests;
