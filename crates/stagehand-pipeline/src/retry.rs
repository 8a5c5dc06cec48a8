//! Bounded retry with configurable backoff policies.

use std::future::Future;
use std::time::Duration;

/// Backoff policy controlling the delay between retry attempts.
#[derive(Debug, Clone)]
pub enum BackoffPolicy {
    /// Fixed delay between retries.
    Fixed(Duration),
    /// Exponential backoff: base * 2^attempt, capped at max.
    Exponential { base: Duration, max: Duration },
    /// No delay between retries.
    None,
}

impl BackoffPolicy {
    /// Compute the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        match self {
            BackoffPolicy::Fixed(d) => *d,
            BackoffPolicy::Exponential { base, max } => {
                let factor = 2u64.saturating_pow(u32::try_from(attempt).unwrap_or(u32::MAX));
                let millis = u64::try_from(base.as_millis())
                    .unwrap_or(u64::MAX)
                    .saturating_mul(factor);
                Duration::from_millis(millis).min(*max)
            }
            BackoffPolicy::None => Duration::ZERO,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            base: Duration::from_secs(1),
            max: Duration::from_secs(8),
        }
    }
}

/// Call `f` until it succeeds or `max_attempts` calls have been made.
///
/// Returns the last result together with the number of attempts used.
/// `max_attempts` of zero is treated as one.
pub async fn retry_with_backoff<T, E, F, Fut>(
    f: F,
    max_attempts: usize,
    policy: &BackoffPolicy,
    label: &str,
) -> (Result<T, E>, usize)
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f().await {
            Ok(value) => return (Ok(value), attempt),
            Err(e) if attempt < max_attempts => {
                let delay = policy.delay_for_attempt(attempt - 1);
                tracing::debug!(
                    target_name = %label,
                    attempt,
                    delay_ms = %delay.as_millis(),
                    error = %e,
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return (Err(e), attempt),
        }
    }
}
