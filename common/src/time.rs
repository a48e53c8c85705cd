//! Monotonic time types used for timeouts, keepalives and search expiry.
//!
//! Modelled as a thin wrapper over [`std::time::Instant`] so that timers
//! (read/write timeouts, the 30s hub keepalive, search lifetime windows) can
//! be exercised deterministically in tests via [`Clock`] without depending on
//! wall-clock time directly.

use std::ops::{Add, Sub};
use std::time::{Duration, Instant};

/// A point in time, relative to some unspecified epoch.
///
/// Only differences between two `LocalTime`s are meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocalTime(Duration);

impl LocalTime {
    /// Time elapsed since `earlier`. Panics if `earlier` is later than `self`.
    pub fn duration_since(&self, earlier: LocalTime) -> LocalDuration {
        LocalDuration(self.0 - earlier.0)
    }
}

impl Add<LocalDuration> for LocalTime {
    type Output = LocalTime;

    fn add(self, rhs: LocalDuration) -> LocalTime {
        LocalTime(self.0 + rhs.0)
    }
}

impl Sub<LocalDuration> for LocalTime {
    type Output = LocalTime;

    fn sub(self, rhs: LocalDuration) -> LocalTime {
        LocalTime(self.0.saturating_sub(rhs.0))
    }
}

/// A span of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct LocalDuration(Duration);

impl LocalDuration {
    /// Construct a duration from a whole number of seconds.
    pub const fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    /// Construct a duration from a whole number of milliseconds.
    pub const fn from_millis(ms: u64) -> Self {
        Self(Duration::from_millis(ms))
    }

    /// Convert to [`std::time::Duration`], e.g. to pass to a socket timeout setter.
    pub fn into_duration(self) -> Duration {
        self.0
    }
}

impl From<LocalDuration> for Duration {
    fn from(d: LocalDuration) -> Duration {
        d.0
    }
}

/// A source of [`LocalTime`].
///
/// Abstracted so tests can advance time deterministically instead of
/// sleeping; the event loop uses [`SystemClock`] in production.
pub trait Clock {
    /// The current local time, as seen by this clock.
    fn local_time(&self) -> LocalTime;
}

/// A [`Clock`] backed by [`std::time::Instant`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock {
    start: Option<Instant>,
}

impl SystemClock {
    /// Create a new system clock, anchored to the current instant.
    pub fn new() -> Self {
        Self {
            start: Some(Instant::now()),
        }
    }
}

impl Clock for SystemClock {
    fn local_time(&self) -> LocalTime {
        let start = self.start.unwrap_or_else(Instant::now);
        LocalTime(Instant::now().saturating_duration_since(start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_since_is_non_negative_for_later_times() {
        let clock = SystemClock::new();
        let t0 = clock.local_time();
        std::thread::sleep(Duration::from_millis(5));
        let t1 = clock.local_time();
        assert!(t1.duration_since(t0) >= LocalDuration::from_millis(0));
    }

    #[test]
    fn add_and_sub_round_trip() {
        let t0 = SystemClock::new().local_time();
        let d = LocalDuration::from_secs(30);
        assert_eq!((t0 + d) - d, t0);
    }
}
