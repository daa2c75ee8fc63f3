//! Retry policy for stream publishes.
//!
//! Transient backend failures are retried with exponential backoff and
//! ±25% jitter; once attempts are exhausted the last error is surfaced.

use crate::config::StreamsConfig;
use crate::errors::{StreamLogError, StreamLogResult};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Configuration for publish retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// Base delay between attempts.
    pub base_delay: Duration,
    /// Maximum delay between attempts.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Which errors are retried.
    pub policy: RetryPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            policy: RetryPolicy::default(),
        }
    }
}

impl From<&StreamsConfig> for RetryConfig {
    fn from(config: &StreamsConfig) -> Self {
        Self {
            max_attempts: config.publish_max_attempts.max(1),
            base_delay: Duration::from_millis(config.initial_backoff_ms),
            max_delay: Duration::from_millis(config.max_backoff_ms),
            ..Self::default()
        }
    }
}

/// Policy defining which errors should trigger a retry.
#[derive(Debug, Clone, Default)]
pub enum RetryPolicy {
    /// Only retry errors the backend reports as transient.
    #[default]
    TransientOnly,
    /// Retry every error.
    All,
    /// Never retry.
    Never,
    /// Custom policy with user-defined predicate.
    Custom(fn(&StreamLogError) -> bool),
}

impl RetryPolicy {
    /// Determines if an error should trigger a retry.
    pub fn should_retry(&self, error: &StreamLogError) -> bool {
        match self {
            Self::TransientOnly => error.is_transient(),
            Self::All => true,
            Self::Never => false,
            Self::Custom(predicate) => predicate(error),
        }
    }
}

/// An operation that failed on every allowed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exhausted {
    /// Attempts made
    pub attempts: u32,
    /// Error of the last attempt
    pub error: StreamLogError,
}

impl RetryConfig {
    /// A configuration that makes a single attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            policy: RetryPolicy::Never,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based).
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        use rand::Rng;

        let base_delay_ms = self.base_delay.as_millis() as f64;
        let max_delay_ms = self.max_delay.as_millis() as f64;

        let delay = base_delay_ms * self.backoff_multiplier.powi(attempt as i32);
        let delay = delay.min(max_delay_ms);

        let mut rng = rand::rng();
        let jitter = delay * 0.25 * (rng.random::<f64>() - 0.5) * 2.0;
        let final_delay = (delay + jitter).max(0.0).min(max_delay_ms) as u64;

        Duration::from_millis(final_delay)
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable error,
    /// or attempts run out.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut attempt_fn: F) -> Result<T, Exhausted>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StreamLogResult<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match attempt_fn().await {
                Ok(value) => return Ok(value),
                Err(error) if attempt < self.max_attempts && self.policy.should_retry(&error) => {
                    let delay = self.delay_for(attempt - 1);
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %error,
                        "retrying stream operation"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(Exhausted { attempts: attempt, error }),
            }
        }
    }
}
