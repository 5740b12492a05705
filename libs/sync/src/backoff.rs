// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::hint;

/// Escalating backoff for the engine's contended retry loops.
///
/// Two disciplines share this type. Compare-exchange loops that are certain
/// to be short (queue heads, steal races, the spin [`Mutex`]) use an
/// unbounded [`Backoff::new`] and simply keep spinning, each round issuing
/// more pause hints than the last. Lock paths that may wait for a real
/// critical section (the [`ReentrantMutex`] slow path) give the backoff a
/// spin budget instead: once [`spin`] has burned through it, it starts
/// returning `false`, which is the signal to stop burning the core and park
/// on the lock's address.
///
/// [`Mutex`]: crate::Mutex
/// [`ReentrantMutex`]: crate::ReentrantMutex
/// [`spin`]: Self::spin
#[derive(Debug, Copy, Clone)]
pub struct Backoff {
    /// Pause hints the next round will issue; doubles up to the round cap.
    round: u32,
    /// Pause hints left before `spin` reports exhaustion; `None` when
    /// unbounded.
    remaining: Option<u32>,
}

// === impl Backoff ===

impl Backoff {
    /// The most pause hints a single [`spin`](Self::spin) round will issue.
    ///
    /// Kept to one cache-line refill or so; past this point more spinning
    /// only delays noticing that the other side has made progress.
    pub const MAX_ROUND: u32 = 64;

    /// An unbounded backoff for loops that never park.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            round: 1,
            remaining: None,
        }
    }

    /// A backoff that reports exhaustion after roughly `total_spins` pause
    /// hints, for lock paths that fall back to the parking lot.
    #[must_use]
    pub const fn with_spin_budget(total_spins: u32) -> Self {
        Self {
            round: 1,
            remaining: Some(total_spins),
        }
    }

    /// Backs off for one round, escalating the round length.
    ///
    /// Returns true while spinning is still the right call. A budgeted
    /// backoff returns false once the budget is exhausted; the caller should
    /// then park instead of calling `spin` again.
    #[inline]
    pub fn spin(&mut self) -> bool {
        let mut spins = self.round;
        if let Some(remaining) = &mut self.remaining {
            if *remaining == 0 {
                return false;
            }
            spins = spins.min(*remaining);
            *remaining -= spins;
        }

        for _ in 0..spins {
            // In tests, especially in loom tests, we need to yield the thread back to the runtime
            // so it can make progress. See https://github.com/tokio-rs/loom/issues/162#issuecomment-665128979
            #[cfg(loom)]
            loom::thread::yield_now();
            #[cfg(all(test, not(loom)))]
            std::thread::yield_now();

            hint::spin_loop();
        }

        if self.round < Self::MAX_ROUND {
            self.round *= 2;
        }
        true
    }

    /// Drops back to the shortest round. The spin budget is not replenished.
    #[inline]
    pub fn reset(&mut self) {
        self.round = 1;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_never_exhausts() {
        let mut boff = Backoff::new();
        for _ in 0..1000 {
            assert!(boff.spin());
        }
    }

    #[test]
    fn budget_runs_out() {
        let mut boff = Backoff::with_spin_budget(100);
        let mut rounds = 0;
        while boff.spin() {
            rounds += 1;
            assert!(rounds < 1000, "budget never exhausted");
        }
        // exhausted stays exhausted
        assert!(!boff.spin());
        // 1 + 2 + 4 + ... rounds cover 100 spins well before 1000 rounds
        assert!(rounds >= 7);
    }

    #[test]
    fn zero_budget_parks_immediately() {
        let mut boff = Backoff::with_spin_budget(0);
        assert!(!boff.spin());
    }

    #[test]
    fn reset_restarts_the_escalation() {
        let mut boff = Backoff::new();
        for _ in 0..10 {
            boff.spin();
        }
        boff.reset();
        assert!(boff.spin());
    }
}
