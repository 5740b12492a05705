// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Monotonic time types for timed waits.
//!
//! Timed waits across the engine accept either a relative [`TimeSpan`] or an
//! absolute [`TimePoint`]. Both are measured in seconds as `f64`, which makes
//! infinity representable (an infinite wait) and keeps conversion to and from
//! platform timers trivial.

mod span;
mod point;

pub use point::TimePoint;
pub use span::TimeSpan;

use std::sync::OnceLock;
use std::time::Instant;

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Cycle counter for wait-time diagnostics.
///
/// Nanoseconds since the process-wide monotonic epoch. Only ever compared
/// against other values returned by this function.
#[must_use]
pub fn monotonic_cycles() -> u64 {
    u64::try_from(epoch().elapsed().as_nanos()).unwrap_or(u64::MAX)
}

/// Seconds since the process-wide monotonic epoch.
#[must_use]
pub fn monotonic_seconds() -> f64 {
    epoch().elapsed().as_secs_f64()
}
