//! Circuit breaker guarding consumer-side backend calls.
//!
//! The breaker counts consecutive backend failures. Once the configured
//! number is reached it opens and calls fail fast with
//! [`StreamError::CircuitOpen`] until a backoff elapses. The next call is
//! then let through as a trial: success closes the circuit, failure reopens
//! it with the backoff doubled up to a cap.
//!
//! States:
//! - **Closed**: calls pass through
//! - **Open**: calls are rejected until the backoff elapses
//! - **HalfOpen**: one trial call is in flight

use crate::config::StreamsConfig;
use crate::errors::{StreamError, StreamLogError, StreamLogResult, StreamResult};
use parking_lot::Mutex;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit
    pub failures_to_open: u32,
    /// Time the circuit stays open after it first opens
    pub initial_backoff: Duration,
    /// Cap for the doubling backoff
    pub max_backoff: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failures_to_open: 1,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl From<&StreamsConfig> for BreakerConfig {
    fn from(config: &StreamsConfig) -> Self {
        let initial_backoff = Duration::from_millis(config.circuit_initial_backoff_ms);
        Self {
            failures_to_open: config.num_failures_open_circuit_breaker.max(1),
            initial_backoff,
            max_backoff: Duration::from_millis(config.circuit_max_backoff_ms).max(initial_backoff),
        }
    }
}

/// Circuit breaker state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed, calls pass through normally
    Closed,
    /// Circuit is open, calls fail fast
    Open,
    /// Circuit is half-open, a trial call decides what happens next
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Whether a backend error counts against the circuit.
///
/// Only failures of the backend itself do; protocol errors such as a
/// missing group or a message that is not pending leave the circuit alone.
pub const fn trips_circuit(error: &StreamLogError) -> bool {
    matches!(error, StreamLogError::Unavailable(_) | StreamLogError::Internal(_))
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    backoff: Duration,
    // Open: when the circuit opened. HalfOpen: when the trial started.
    since: Instant,
}

impl BreakerState {
    fn new(config: &BreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            backoff: config.initial_backoff,
            since: Instant::now(),
        }
    }

    /// `Err` carries the time left before the next trial.
    fn can_attempt(&mut self) -> Result<(), Duration> {
        match self.state {
            CircuitState::Closed => Ok(()),
            // A trial that never reported back (its caller was dropped)
            // stops blocking the circuit after one backoff.
            CircuitState::Open | CircuitState::HalfOpen => {
                let elapsed = self.since.elapsed();
                if elapsed >= self.backoff {
                    self.state = CircuitState::HalfOpen;
                    self.since = Instant::now();
                    debug!("circuit breaker moved to half-open state");
                    Ok(())
                } else {
                    Err(self.backoff - elapsed)
                }
            }
        }
    }

    fn record_success(&mut self, config: &BreakerConfig) {
        if self.state != CircuitState::Closed {
            debug!("circuit breaker closed after successful trial");
        }
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.backoff = config.initial_backoff;
    }

    fn record_failure(&mut self, config: &BreakerConfig) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        match self.state {
            CircuitState::HalfOpen => {
                self.backoff = (self.backoff * 2).min(config.max_backoff);
                self.open();
            }
            CircuitState::Closed if self.consecutive_failures >= config.failures_to_open => {
                self.backoff = config.initial_backoff;
                self.open();
            }
            CircuitState::Closed | CircuitState::Open => {}
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.since = Instant::now();
        warn!(
            failures = self.consecutive_failures,
            backoff_ms = u64::try_from(self.backoff.as_millis()).unwrap_or(u64::MAX),
            "circuit breaker opened"
        );
    }
}

/// Fails fast while the stream backend keeps failing.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: Mutex<BreakerState>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

impl CircuitBreaker {
    /// Creates a closed circuit breaker.
    pub fn new(config: BreakerConfig) -> Self {
        let state = Mutex::new(BreakerState::new(&config));
        Self { config, state }
    }

    /// The configuration in use.
    pub const fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Executes a backend call through the circuit breaker.
    ///
    /// Rejected calls never reach `operation`.
    pub async fn call<T, F, Fut>(&self, operation: F) -> StreamResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StreamLogResult<T>>,
    {
        self.state
            .lock()
            .can_attempt()
            .map_err(|retry_in| StreamError::CircuitOpen { retry_in })?;

        let result = operation().await;
        match &result {
            Err(error) if trips_circuit(error) => self.state.lock().record_failure(&self.config),
            _ => self.state.lock().record_success(&self.config),
        }
        result.map_err(StreamError::from)
    }

    /// Gets the current circuit breaker state.
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConsumerGroup, StreamName};

    fn config(failures_to_open: u32, initial_ms: u64, max_ms: u64) -> BreakerConfig {
        BreakerConfig {
            failures_to_open,
            initial_backoff: Duration::from_millis(initial_ms),
            max_backoff: Duration::from_millis(max_ms),
        }
    }

    async fn fail(breaker: &CircuitBreaker) -> StreamResult<()> {
        breaker
            .call(|| async { Err(StreamLogError::Unavailable("down".into())) })
            .await
    }

    async fn succeed(breaker: &CircuitBreaker) -> StreamResult<u32> {
        breaker.call(|| async { Ok(7) }).await
    }

    #[tokio::test]
    async fn opens_after_consecutive_failures() {
        let breaker = CircuitBreaker::new(config(2, 10_000, 60_000));
        assert!(matches!(fail(&breaker).await, Err(StreamError::Log(_))));
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(matches!(fail(&breaker).await, Err(StreamError::Log(_))));
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn success_resets_the_failure_count() {
        let breaker = CircuitBreaker::new(config(2, 10_000, 60_000));
        fail(&breaker).await.unwrap_err();
        assert_eq!(succeed(&breaker).await.unwrap(), 7);
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn open_circuit_rejects_without_calling_the_backend() {
        let breaker = CircuitBreaker::new(config(1, 10_000, 60_000));
        fail(&breaker).await.unwrap_err();

        let mut called = false;
        let err = breaker
            .call(|| {
                called = true;
                async { Ok(()) }
            })
            .await
            .unwrap_err();
        assert!(!called);
        match err {
            StreamError::CircuitOpen { retry_in } => assert!(retry_in <= Duration::from_secs(10)),
            other => panic!("expected open circuit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn successful_trial_closes_the_circuit() {
        let breaker = CircuitBreaker::new(config(1, 10, 1_000));
        fail(&breaker).await.unwrap_err();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(succeed(&breaker).await.unwrap(), 7);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn failed_trial_doubles_the_backoff_up_to_the_cap() {
        let breaker = CircuitBreaker::new(config(1, 10, 15));
        fail(&breaker).await.unwrap_err();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(fail(&breaker).await, Err(StreamError::Log(_))));
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.state.lock().backoff, Duration::from_millis(15));
    }

    #[tokio::test]
    async fn protocol_errors_do_not_trip_the_circuit() {
        let breaker = CircuitBreaker::new(config(1, 10_000, 60_000));
        let err = breaker
            .call(|| async {
                Err::<(), _>(StreamLogError::GroupNotFound {
                    stream: StreamName::try_new("s").unwrap(),
                    group: ConsumerGroup::try_new("g").unwrap(),
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::Log(StreamLogError::GroupNotFound { .. })));
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn config_follows_streams_settings() {
        let streams = StreamsConfig {
            num_failures_open_circuit_breaker: 0,
            circuit_initial_backoff_ms: 2_000,
            circuit_max_backoff_ms: 500,
            ..StreamsConfig::default()
        };
        let config = BreakerConfig::from(&streams);
        assert_eq!(config.failures_to_open, 1);
        assert_eq!(config.initial_backoff, Duration::from_secs(2));
        assert_eq!(config.max_backoff, Duration::from_secs(2));
    }
}
