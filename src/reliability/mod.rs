//! Retry with exponential backoff for idempotent external calls.
//!
//! Only wrap calls that are safe to repeat and carry no stream state (status
//! checks, metadata lookups). The live audio relay is never retried: a
//! replayed chunk would reach the upstream out of order. Upstream reconnects
//! reuse [`RetryPolicy`] for their backoff schedule only.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use crate::config::ReliabilityConfig;

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BASE_DELAY_MS: u64 = 250;
const DEFAULT_MAX_DELAY_MS: u64 = 8_000;

/// Backoff configuration. `max_retries` counts retries, so an operation runs
/// at most `max_retries + 1` times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
        }
    }
}

impl From<&ReliabilityConfig> for RetryPolicy {
    fn from(config: &ReliabilityConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms.max(config.base_delay_ms)),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            ..Self::default()
        }
    }

    /// Single attempt, no backoff.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Delay before retry number `retry` (1-based): `base * 2^(retry - 1)`,
    /// capped at `max_delay`. Retry 0 is the first attempt and never waits.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32 << (retry - 1).min(20);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// True when every retry waits strictly longer than the one before,
    /// i.e. the last doubled delay still fits under `max_delay`.
    pub fn strictly_increasing(&self) -> bool {
        if self.max_retries <= 1 {
            return self.max_retries == 0 || !self.base_delay.is_zero();
        }
        if self.base_delay.is_zero() {
            return false;
        }
        2u32.checked_pow(self.max_retries - 1)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .is_some_and(|last| last <= self.max_delay)
    }

    /// Run `op` until it succeeds or the retry budget is spent.
    ///
    /// `op` receives the zero-based attempt number. Every failed attempt is
    /// logged; exhaustion returns all collected errors in attempt order.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let max_attempts = self.max_retries.saturating_add(1);
        let mut errors = Vec::new();

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let delay = self.delay_for_retry(attempt);
                tracing::debug!(
                    operation,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Backing off before retry"
                );
                tokio::time::sleep(delay).await;
            }

            match op(attempt).await {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::info!(operation, attempts = attempt + 1, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    tracing::warn!(
                        operation,
                        attempt = attempt + 1,
                        max_attempts,
                        error = %e,
                        "Attempt failed"
                    );
                    errors.push(e);
                }
            }
        }

        Err(RetryError::Exhausted {
            operation: operation.to_string(),
            errors,
        })
    }
}

/// Aggregated failure once every attempt has failed.
#[derive(Debug)]
pub enum RetryError<E> {
    Exhausted { operation: String, errors: Vec<E> },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> usize {
        match self {
            Self::Exhausted { errors, .. } => errors.len(),
        }
    }

    pub fn last(&self) -> Option<&E> {
        match self {
            Self::Exhausted { errors, .. } => errors.last(),
        }
    }

    pub fn into_errors(self) -> Vec<E> {
        match self {
            Self::Exhausted { errors, .. } => errors,
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted { operation, errors } => {
                write!(f, "{operation} failed after {} attempt(s)", errors.len())?;
                for (i, e) in errors.iter().enumerate() {
                    write!(f, "; #{}: {e}", i + 1)?;
                }
                Ok(())
            }
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryError<E> {}
