//! Microsecond-granularity monotonic timestamps.
//!
//! The reactor orders timers and stamps readiness events with a monotonic
//! clock so that wall-clock adjustments never reorder expirations. A
//! `Timestamp` is the number of microseconds since an arbitrary (per-boot)
//! epoch, which keeps it `Copy`, totally ordered, and cheap to pass through
//! callback signatures.

#![allow(unsafe_code)]

use std::fmt;
use std::time::Duration;

pub const MICROS_PER_SECOND: u64 = 1_000_000;

/// A monotonic point in time with microsecond resolution.
///
/// `Timestamp::default()` is the zero (invalid) timestamp; every value
/// returned by [`Timestamp::now`] is strictly greater than it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Sample the monotonic clock.
    #[must_use]
    pub fn now() -> Self {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // CLOCK_MONOTONIC cannot fail with a valid timespec pointer.
        let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        debug_assert_eq!(rc, 0);
        Self(ts.tv_sec as u64 * MICROS_PER_SECOND + ts.tv_nsec as u64 / 1_000)
    }

    /// Construct from a raw microsecond count.
    #[must_use]
    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    /// Microseconds since the monotonic epoch.
    #[must_use]
    pub const fn as_micros(self) -> u64 {
        self.0
    }

    /// `true` for any timestamp actually sampled from the clock.
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 > 0
    }

    /// This timestamp shifted `d` into the future.
    #[must_use]
    pub fn add(self, d: Duration) -> Self {
        Self(self.0 + d.as_micros() as u64)
    }

    /// Time elapsed from `earlier` to `self`, saturating to zero when
    /// `earlier` is the later of the two.
    #[must_use]
    pub fn duration_since(self, earlier: Self) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:06}",
            self.0 / MICROS_PER_SECOND,
            self.0 % MICROS_PER_SECOND
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_monotonic() {
        let a = Timestamp::now();
        let b = Timestamp::now();
        assert!(a.is_valid());
        assert!(b >= a);
    }

    #[test]
    fn test_add_and_duration_since() {
        let t = Timestamp::from_micros(1_500_000);
        let later = t.add(Duration::from_millis(250));
        assert_eq!(later.as_micros(), 1_750_000);
        assert_eq!(later.duration_since(t), Duration::from_millis(250));
        // Saturates instead of panicking when reversed.
        assert_eq!(t.duration_since(later), Duration::ZERO);
    }

    #[test]
    fn test_display_format() {
        let t = Timestamp::from_micros(3 * MICROS_PER_SECOND + 42);
        assert_eq!(t.to_string(), "3.000042");
    }
}
