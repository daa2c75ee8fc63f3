//! Per read-loop throughput counters.

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Processed and failed message counts of one read loop.
#[derive(Debug, Default)]
pub struct StreamStats {
    processed: AtomicU64,
    failed: AtomicU64,
    started: Mutex<Option<Instant>>,
}

/// Point-in-time copy of [`StreamStats`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsSnapshot {
    /// Messages handled successfully
    pub processed: u64,
    /// Messages whose handling failed
    pub failed: u64,
    /// Time since the first message was seen
    pub elapsed: Duration,
}

impl StatsSnapshot {
    /// Messages per second since the first message, failures included.
    #[allow(clippy::cast_precision_loss)]
    pub fn rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= f64::EPSILON {
            return 0.0;
        }
        (self.processed + self.failed) as f64 / secs
    }

    /// Fields for a STATS log entry.
    pub fn to_json(&self) -> Value {
        json!({
            "processed": self.processed,
            "failed": self.failed,
            "rate": (self.rate() * 100.0).round() / 100.0,
        })
    }
}

impl StreamStats {
    /// Zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    fn mark_started(&self) {
        self.started.lock().get_or_insert_with(Instant::now);
    }

    /// Counts a handled message.
    pub fn record_processed(&self) {
        self.mark_started();
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a failed message.
    pub fn record_failed(&self) {
        self.mark_started();
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Handled messages so far.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Failed messages so far.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Current counts.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            processed: self.processed(),
            failed: self.failed(),
            elapsed: self
                .started
                .lock()
                .map_or(Duration::ZERO, |started| started.elapsed()),
        }
    }
}
