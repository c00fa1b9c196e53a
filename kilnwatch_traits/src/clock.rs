use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Monotonic clock abstraction for pacing and timing across the stack.
///
/// - now(): returns a monotonic Instant
/// - wall_now(): returns the wall-clock time used for record timestamps
/// - sleep(): sleeps for the provided duration (implementations may simulate)
/// - ms_since(): helper to compute elapsed milliseconds from an epoch Instant
pub trait Clock {
    fn now(&self) -> Instant;
    fn wall_now(&self) -> DateTime<Utc>;
    fn sleep(&self, d: Duration);

    /// Milliseconds elapsed since `epoch`, saturating at 0 on underflow.
    fn ms_since(&self, epoch: Instant) -> u64 {
        let dur = self.now().saturating_duration_since(epoch);
        dur.as_millis() as u64
    }
}

/// Default, real-time monotonic clock backed by std::time::Instant.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl MonotonicClock {
    #[inline]
    pub fn new() -> Self {
        Self
    }
}

impl Clock for MonotonicClock {
    #[inline]
    fn now(&self) -> Instant {
        Instant::now()
    }

    #[inline]
    fn wall_now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    #[inline]
    fn sleep(&self, d: Duration) {
        if d.is_zero() {
            return;
        }
        thread::sleep(d);
    }
}

/// Deterministic clock whose time is advanced manually.
///
/// now() = origin + offset; wall_now() = wall origin + offset.
/// sleep(d) advances internal time by d without actually sleeping.
/// Public (not test-gated) because replay tools and integration tests in
/// downstream crates drive it.
#[derive(Debug, Clone)]
pub struct ManualClock {
    origin: Instant,
    wall_origin: DateTime<Utc>,
    offset: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new(wall_origin: DateTime<Utc>) -> Self {
        Self {
            origin: Instant::now(),
            wall_origin,
            offset: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// Advance the clock by the given duration.
    pub fn advance(&self, d: Duration) {
        if let Ok(mut off) = self.offset.lock() {
            *off = off.saturating_add(d);
        }
    }

    /// Set the absolute offset relative to origin.
    pub fn set_offset(&self, d: Duration) {
        if let Ok(mut off) = self.offset.lock() {
            *off = d;
        }
    }

    fn offset(&self) -> Duration {
        self.offset.lock().map(|g| *g).unwrap_or(Duration::ZERO)
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(DateTime::<Utc>::UNIX_EPOCH)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.offset()
    }

    fn wall_now(&self) -> DateTime<Utc> {
        self.wall_origin
            + chrono::Duration::milliseconds(self.offset().as_millis() as i64)
    }

    fn sleep(&self, d: Duration) {
        self.advance(d);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_without_sleeping() {
        let clk = ManualClock::default();
        let epoch = clk.now();
        clk.sleep(Duration::from_millis(250));
        assert_eq!(clk.ms_since(epoch), 250);
    }

    #[test]
    fn manual_clock_wall_tracks_offset() {
        let clk = ManualClock::default();
        clk.advance(Duration::from_secs(5));
        assert_eq!(
            clk.wall_now(),
            DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::seconds(5)
        );
    }
}
