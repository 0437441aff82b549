//! Exponential backoff for FHIR calls.
//!
//! Only transient errors are retried (see [`FhirErrorKind`]); permanent errors
//! return immediately. The default policy is 3 retries with 1s, 2s, 4s delays.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use super::error::{FhirError, FhirErrorKind};

/// Configuration for exponential backoff retry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    /// Retry attempts after the initial attempt.
    pub max_retries: u32,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Cap for exponential growth.
    pub max_delay: Duration,

    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// 3 retries with 1s, 2s, 4s delays (8s cap).
    pub const DEFAULT: Self = Self {
        max_retries: 3,
        initial_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(8),
        backoff_multiplier: 2.0,
    };

    pub fn new(
        max_retries: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
            backoff_multiplier,
        }
    }

    /// Computes the delay before retry number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = self.backoff_multiplier.powi(attempt as i32);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()))
    }

    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_retries).map(|attempt| self.delay_for_attempt(attempt))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Runs `operation` until it succeeds, fails permanently, or retries run out.
///
/// On exhaustion the last transient error is returned.
pub async fn retry_with_backoff<T, F, Fut>(
    config: RetryConfig,
    what: &str,
    mut operation: F,
) -> Result<T, FhirError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FhirError>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.kind == FhirErrorKind::Permanent => return Err(e),
            Err(e) => {
                if attempt >= config.max_retries {
                    return Err(e);
                }
                let delay = config.delay_for_attempt(attempt);
                attempt += 1;
                warn!(
                    operation = what,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient FHIR error, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
