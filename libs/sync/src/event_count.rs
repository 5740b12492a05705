// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::park;
use core::sync::atomic::{AtomicU32, Ordering};
use emtime::TimeSpan;

/// A token captured by [`EventCount::prepare_wait`].
///
/// Acquiring a token *before* checking the condition closes the race between
/// "check condition" and "go to sleep": a wait against a token that no
/// longer matches the notification count returns immediately.
#[derive(Debug, Clone, Copy)]
pub struct WaitToken(u32);

impl WaitToken {
    /// True once the token has been assigned by `prepare_wait`.
    #[must_use]
    pub fn is_valid(self) -> bool {
        self.0 & 1 == 0
    }
}

impl Default for WaitToken {
    /// An odd value, which is never valid to wait on.
    fn default() -> Self {
        Self(1)
    }
}

/// An event that cannot miss notifications.
///
/// The counter's low bit flags "waiters present"; the remaining bits count
/// notifications. Typical usage, waiting side:
///
/// ```ignore
/// let token = event.prepare_wait();
/// if current < target {
///     event.wait(token);
/// }
/// ```
///
/// and notifying side:
///
/// ```ignore
/// current += 1; // the condition the waiter checks
/// event.notify();
/// ```
///
/// The notification increment happens-after any preceding `prepare_wait`, so
/// a waiter either observes the updated condition or its token mismatch.
#[derive(Debug, Default)]
pub struct EventCount {
    count: AtomicU32,
}

// === impl EventCount ===

impl EventCount {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            count: AtomicU32::new(0),
        }
    }

    /// Prepares to wait.
    ///
    /// Call this before any logic that must re-execute if the event is
    /// notified in the meantime.
    pub fn prepare_wait(&self) -> WaitToken {
        #[cfg(any(target_arch = "x86_64", target_arch = "x86"))]
        {
            // fetch_or on x86 cannot return the previous value, so using its
            // result compiles into a compare-exchange loop. A relaxed load is
            // enough: the worst case is a stale token and one spurious
            // non-wait iteration.
            let token = WaitToken(self.count.load(Ordering::Relaxed) & !1);
            self.count.fetch_or(1, Ordering::AcqRel);
            token
        }
        #[cfg(not(any(target_arch = "x86_64", target_arch = "x86")))]
        {
            WaitToken(self.count.fetch_or(1, Ordering::AcqRel) & !1)
        }
    }

    /// Waits until notified, returning immediately if a notification arrived
    /// since the token was acquired.
    pub fn wait(&self, token: WaitToken) {
        if self.value() == token.0 {
            park::wait(self.address(), || self.value() == token.0, || {});
        }
    }

    /// Like [`wait`](Self::wait) with a timeout. Returns true if notified
    /// before the timeout elapsed.
    pub fn wait_for(&self, token: WaitToken, timeout: TimeSpan) -> bool {
        if self.value() != token.0 {
            return true;
        }
        let state = park::wait_for(
            self.address(),
            || self.value() == token.0,
            || {},
            timeout,
        );
        // True if woken, and also if the wait was skipped because the value
        // changed before we had the opportunity to sleep.
        state.did_wake || !state.did_wait
    }

    /// Notifies all waiting threads.
    ///
    /// Threads that have called `prepare_wait` and not yet waited are
    /// released immediately when they do wait on their token.
    pub fn notify(&self) {
        // fetch_add(0, AcqRel) stands in for the StoreLoad barrier the
        // algorithm needs, which plain loads cannot express.
        let value = self.count.fetch_add(0, Ordering::AcqRel);
        self.notify_value(value);
    }

    /// Notifies all waiting threads, without providing a memory barrier for
    /// the protected value.
    ///
    /// The caller is responsible for the ordering of whatever condition this
    /// event count synchronizes.
    pub fn notify_weak(&self) {
        #[cfg(any(target_arch = "x86_64", target_arch = "x86"))]
        let value = {
            // The fetch_or inside prepare_wait is a serializing instruction
            // on x86, so the expensive locked op can be skipped here.
            self.count.load(Ordering::Relaxed)
        };
        #[cfg(not(any(target_arch = "x86_64", target_arch = "x86")))]
        let value = self.count.fetch_add(0, Ordering::AcqRel);

        self.notify_value(value);
    }

    fn notify_value(&self, value: u32) {
        // Adding one to an odd value clears the waiters flag and advances
        // the notification count in a single operation. Losing the race
        // means another notify advanced the count and woke for us.
        if value & 1 == 1
            && self
                .count
                .compare_exchange(value, value.wrapping_add(1), Ordering::Release, Ordering::Relaxed)
                .is_ok()
        {
            park::wake_all(self.address());
        }
    }

    /// Counter value with the waiters flag masked off.
    fn value(&self) -> u32 {
        self.count.load(Ordering::Acquire) & !1
    }

    fn address(&self) -> *const () {
        core::ptr::from_ref(&self.count).cast()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering as StdOrdering};

    #[test]
    fn default_token_is_invalid() {
        assert!(!WaitToken::default().is_valid());
    }

    #[test]
    fn notification_between_prepare_and_wait_is_not_missed() {
        let count = EventCount::new();
        let token = count.prepare_wait();
        assert!(token.is_valid());

        count.notify();

        // The token mismatch makes this return without blocking.
        count.wait(token);
    }

    #[test]
    fn notify_without_waiters_is_cheap() {
        let count = EventCount::new();
        // No flag set: notify must not advance the counter.
        count.notify();
        let token = count.prepare_wait();
        count.notify();
        assert!(count.wait_for(token, TimeSpan::ZERO));
    }

    #[test]
    fn double_notify_equals_notify_for_new_waiters() {
        let count = EventCount::new();

        let t1 = count.prepare_wait();
        count.notify();
        count.notify();
        count.wait(t1); // released by the first notify

        // A fresh token must actually wait again.
        let t2 = count.prepare_wait();
        assert!(!count.wait_for(t2, TimeSpan::from_millis(10.0)));
    }

    #[test]
    fn wakes_sleeping_waiter() {
        let count = Arc::new(EventCount::new());
        let condition = Arc::new(AtomicUsize::new(0));

        let waiter = {
            let count = Arc::clone(&count);
            let condition = Arc::clone(&condition);
            std::thread::spawn(move || {
                loop {
                    let token = count.prepare_wait();
                    if condition.load(StdOrdering::Acquire) == 1 {
                        break;
                    }
                    count.wait(token);
                }
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(10));
        condition.store(1, StdOrdering::Release);
        count.notify();
        waiter.join().unwrap();
    }

    // Producer increments; consumer prepares, checks, sleeps. Hammering this
    // loop exercises the lost-wakeup window.
    #[test]
    fn no_lost_wakeups_under_contention() {
        const TARGET: usize = 10_000;

        let count = Arc::new(EventCount::new());
        let value = Arc::new(AtomicUsize::new(0));

        let consumer = {
            let count = Arc::clone(&count);
            let value = Arc::clone(&value);
            std::thread::spawn(move || {
                loop {
                    let token = count.prepare_wait();
                    if value.load(StdOrdering::Acquire) >= TARGET {
                        break;
                    }
                    count.wait(token);
                }
            })
        };

        for _ in 0..TARGET {
            value.fetch_add(1, StdOrdering::AcqRel);
            count.notify();
        }

        consumer.join().unwrap();
        assert!(value.load(StdOrdering::Acquire) >= TARGET);
    }
}
