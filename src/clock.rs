//! Time sources for the link loop.
//!
//! The loop schedules against a monotonic clock and stamps transmitted lines with wall-clock
//! milliseconds. Both come from a [`Clock`] so tests can step time by hand.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Monotonic and wall-clock time.
pub trait Clock: Send + Sync {
    /// Current monotonic instant.
    fn now(&self) -> Instant;

    /// Milliseconds since the Unix epoch.
    fn unix_millis(&self) -> i64;
}

/// Clock backed by the Tokio timer, so `#[tokio::test(start_paused = true)]` controls it.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }

    fn unix_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use vserial_emu::clock::{Clock, ManualClock};
///
/// let clock = ManualClock::new();
/// let start = clock.now();
/// clock.advance(Duration::from_millis(250));
/// assert_eq!(clock.now() - start, Duration::from_millis(250));
/// ```
#[derive(Debug, Clone)]
pub struct ManualClock {
    origin: Instant,
    offset: Arc<Mutex<Duration>>,
    epoch_millis: i64,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    /// Create a clock frozen at the current instant.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Arc::new(Mutex::new(Duration::ZERO)),
            epoch_millis: 1_700_000_000_000,
        }
    }

    /// Move time forward.
    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(|e| e.into_inner());
        *offset += by;
    }

    fn elapsed(&self) -> Duration {
        *self.offset.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    fn unix_millis(&self) -> i64 {
        self.epoch_millis + self.elapsed().as_millis() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_moves_both_timelines() {
        let clock = ManualClock::new();
        let t0 = clock.now();
        let w0 = clock.unix_millis();

        clock.advance(Duration::from_millis(1500));

        assert_eq!(clock.now() - t0, Duration::from_millis(1500));
        assert_eq!(clock.unix_millis() - w0, 1500);
    }

    #[test]
    fn test_clones_share_time() {
        let clock = ManualClock::new();
        let other = clock.clone();
        clock.advance(Duration::from_secs(2));
        assert_eq!(other.now(), clock.now());
    }

    #[tokio::test(start_paused = true)]
    async fn test_system_clock_follows_paused_tokio_time() {
        let clock = SystemClock;
        let t0 = clock.now();
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(clock.now() - t0 >= Duration::from_secs(3));
    }
}
