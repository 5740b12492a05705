// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::TimeSpan;
use core::fmt;
use core::ops::{Add, Sub};

/// A point in time measured in seconds since an arbitrary process-wide epoch.
///
/// The clock is monotonic: the current time never decreases. Intended for
/// measuring intervals and for absolute-deadline waits, never for wall-clock
/// time.
#[derive(Clone, Copy, Default, PartialEq, PartialOrd)]
pub struct TimePoint(f64);

// === impl TimePoint ===

impl TimePoint {
    pub const INFINITE: Self = Self(f64::INFINITY);

    /// The current monotonic time.
    #[must_use]
    pub fn now() -> Self {
        Self(crate::monotonic_seconds())
    }

    #[must_use]
    pub const fn from_seconds(seconds: f64) -> Self {
        Self(seconds)
    }

    /// Seconds since the epoch.
    #[must_use]
    pub const fn to_seconds(self) -> f64 {
        self.0
    }

    #[must_use]
    pub fn is_infinite(self) -> bool {
        self.0 == f64::INFINITY
    }

    /// Time remaining until this point, measured from `now`.
    #[must_use]
    pub fn remaining_from(self, now: Self) -> TimeSpan {
        if self.is_infinite() {
            TimeSpan::INFINITE
        } else {
            self - now
        }
    }
}

impl Add<TimeSpan> for TimePoint {
    type Output = Self;

    fn add(self, rhs: TimeSpan) -> Self {
        Self(self.0 + rhs.to_seconds())
    }
}

impl Sub<TimeSpan> for TimePoint {
    type Output = Self;

    fn sub(self, rhs: TimeSpan) -> Self {
        Self(self.0 - rhs.to_seconds())
    }
}

impl Sub for TimePoint {
    type Output = TimeSpan;

    fn sub(self, rhs: Self) -> TimeSpan {
        TimeSpan::from_seconds(self.0 - rhs.0)
    }
}

impl fmt::Debug for TimePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_infinite() {
            f.write_str("TimePoint(inf)")
        } else {
            write!(f, "TimePoint({}s)", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_monotonic() {
        let a = TimePoint::now();
        let b = TimePoint::now();
        assert!(b >= a);
    }

    #[test]
    fn deadline_arithmetic() {
        let now = TimePoint::from_seconds(10.0);
        let deadline = now + TimeSpan::from_seconds(2.5);
        assert_eq!((deadline - now).to_seconds(), 2.5);
        assert_eq!(deadline.remaining_from(now).to_seconds(), 2.5);
        assert!(TimePoint::INFINITE.remaining_from(now).is_infinite());
    }
}
