// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::park;
use core::sync::atomic::{AtomicU32, Ordering};
use emtime::{TimePoint, TimeSpan};

/// A counting semaphore built on the parking lot.
///
/// [`acquire`](Self::acquire) decrements the count and blocks while it is
/// zero; [`release`](Self::release) increments it and wakes up to that many
/// waiters. The count never goes negative.
#[derive(Debug)]
pub struct Semaphore {
    count: AtomicU32,
}

// === impl Semaphore ===

impl Semaphore {
    #[must_use]
    pub const fn new(initial: u32) -> Self {
        Self {
            count: AtomicU32::new(initial),
        }
    }

    /// Acquires one unit, blocking while the count is zero.
    pub fn acquire(&self) {
        loop {
            if self.try_acquire() {
                return;
            }
            park::wait(
                self.address(),
                || self.count.load(Ordering::Acquire) == 0,
                || {},
            );
        }
    }

    /// Acquires one unit if the count is positive, without blocking.
    pub fn try_acquire(&self) -> bool {
        self.count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            })
            .is_ok()
    }

    /// Acquires one unit, giving up after `timeout`.
    pub fn try_acquire_for(&self, timeout: TimeSpan) -> bool {
        if timeout.is_infinite() {
            self.acquire();
            return true;
        }
        self.try_acquire_until(TimePoint::now() + timeout)
    }

    /// Acquires one unit, giving up once the clock passes `deadline`.
    pub fn try_acquire_until(&self, deadline: TimePoint) -> bool {
        loop {
            if self.try_acquire() {
                return true;
            }
            if TimePoint::now() >= deadline {
                return false;
            }
            park::wait_until(
                self.address(),
                || self.count.load(Ordering::Acquire) == 0,
                || {},
                deadline,
            );
        }
    }

    /// Releases `count` units and wakes up to that many waiters.
    pub fn release(&self, count: u32) {
        debug_assert!(count > 0);
        self.count.fetch_add(count, Ordering::AcqRel);
        park::wake_multiple(self.address(), count as usize);
    }

    fn address(&self) -> *const () {
        core::ptr::from_ref(&self.count).cast()
    }
}
