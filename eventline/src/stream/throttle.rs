//! Publish rate limiting.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};

/// Spaces successive publishes at least `interval` apart.
///
/// Callers over the rate are delayed, never rejected. Slots are reserved
/// under a lock and waited for outside it, so concurrent callers queue up
/// one interval apart.
#[derive(Debug)]
pub struct Throttle {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl Throttle {
    /// Creates a throttle allowing one publish per `interval`.
    pub const fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    /// The configured interval.
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Reserves the next free slot and returns when it starts.
    pub fn reserve(&self) -> Instant {
        let now = Instant::now();
        let mut next_slot = self.next_slot.lock();
        let slot = match *next_slot {
            Some(next) if next > now => next,
            _ => now,
        };
        *next_slot = Some(slot + self.interval);
        slot
    }

    /// Waits for the next free slot.
    pub async fn acquire(&self) {
        let slot = self.reserve();
        if slot > Instant::now() {
            sleep_until(slot).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_spaced_by_interval() {
        let throttle = Throttle::new(Duration::from_millis(10));
        let first = throttle.reserve();
        let second = throttle.reserve();
        let third = throttle.reserve();
        assert_eq!(second - first, Duration::from_millis(10));
        assert_eq!(third - second, Duration::from_millis(10));
    }

    #[tokio::test]
    async fn acquire_delays_callers() {
        let throttle = Throttle::new(Duration::from_millis(20));
        let started = Instant::now();
        for _ in 0..5 {
            throttle.acquire().await;
        }
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn idle_throttle_does_not_delay() {
        let throttle = Throttle::new(Duration::from_millis(5));
        throttle.acquire().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let started = Instant::now();
        throttle.acquire().await;
        assert!(started.elapsed() < Duration::from_millis(5));
    }
}
