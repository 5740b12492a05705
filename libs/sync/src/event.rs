// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::park;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use emtime::TimeSpan;

/// Specifies the event reset mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventMode {
    /// A successful wait consumes the signal; exactly one waiter is released
    /// per trigger.
    AutoReset,
    /// The event stays signaled until [`Event::reset`] is called.
    ManualReset,
}

/// A waitable event.
///
/// After [`trigger`](Self::trigger) returns, any subsequent wait returns
/// without blocking, until (for auto-reset) exactly one wait consumes the
/// signal, or (for manual-reset) [`reset`](Self::reset) is called.
///
/// Prefer borrowing events from the pool via
/// [`acquire_event`](crate::acquire_event) over constructing them directly;
/// waits and triggers are cheap but each event owns a unique diagnostic id.
#[derive(Debug)]
pub struct Event {
    signaled: AtomicBool,
    mode: EventMode,
    /// Unique id for diagnostics.
    id: u32,
    /// Cycle stamp of the most recent wait entry, for wait-time statistics.
    wait_start_cycles: AtomicU64,
}

static NEXT_EVENT_ID: AtomicU32 = AtomicU32::new(1);

// === impl Event ===

impl Event {
    #[must_use]
    pub fn new(mode: EventMode) -> Self {
        Self {
            signaled: AtomicBool::new(false),
            mode,
            id: NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed),
            wait_start_cycles: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn mode(&self) -> EventMode {
        self.mode
    }

    /// Unique diagnostic id of this event.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Cycle stamp of the most recent wait entry, for wait-time statistics.
    /// Zero before the first blocking wait.
    #[must_use]
    pub fn last_wait_start_cycles(&self) -> u64 {
        self.wait_start_cycles.load(Ordering::Relaxed)
    }

    /// Triggers the event so waiting threads are released.
    pub fn trigger(&self) {
        self.signaled.store(true, Ordering::Release);
        match self.mode {
            EventMode::AutoReset => {
                park::wake_one(self.address());
            }
            EventMode::ManualReset => {
                park::wake_all(self.address());
            }
        }
    }

    /// Resets the event to an untriggered state.
    pub fn reset(&self) {
        self.signaled.store(false, Ordering::Release);
    }

    /// Waits for the event to be triggered.
    pub fn wait(&self) {
        let waited = self.wait_for(TimeSpan::INFINITE);
        debug_assert!(waited);
    }

    /// Waits up to `timeout` for the event to be triggered.
    ///
    /// Returns true if the event was observed signaled, false on timeout.
    pub fn wait_for(&self, timeout: TimeSpan) -> bool {
        if self.try_consume() {
            return true;
        }

        self.wait_start_cycles
            .store(emtime::monotonic_cycles(), Ordering::Relaxed);
        let deadline = if timeout.is_infinite() {
            emtime::TimePoint::INFINITE
        } else {
            emtime::TimePoint::now() + timeout
        };

        loop {
            park::wait_until(self.address(), || !self.is_signaled(), || {}, deadline);

            if self.try_consume() {
                return true;
            }
            // Either a timeout, or a wake lost to another waiter consuming
            // the signal; an untimed wait goes back to sleep.
            if emtime::TimePoint::now() >= deadline {
                return false;
            }
        }
    }

    /// Whether the event is currently signaled, without consuming it.
    #[must_use]
    pub fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }

    fn try_consume(&self) -> bool {
        match self.mode {
            EventMode::AutoReset => self
                .signaled
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
            EventMode::ManualReset => self.is_signaled(),
        }
    }

    fn address(&self) -> *const () {
        core::ptr::from_ref(&self.signaled).cast()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn manual_reset_stays_signaled() {
        let event = Event::new(EventMode::ManualReset);
        event.trigger();
        assert!(event.wait_for(TimeSpan::ZERO));
        assert!(event.wait_for(TimeSpan::ZERO));
        event.reset();
        assert!(!event.wait_for(TimeSpan::ZERO));
    }

    #[test]
    fn auto_reset_consumes_the_signal() {
        let event = Event::new(EventMode::AutoReset);
        event.trigger();
        assert!(event.wait_for(TimeSpan::ZERO));
        assert!(!event.wait_for(TimeSpan::ZERO));
    }

    #[test]
    fn trigger_reset_trigger_equals_trigger() {
        let event = Event::new(EventMode::ManualReset);
        event.trigger();
        event.reset();
        event.trigger();
        assert!(event.wait_for(TimeSpan::ZERO));
    }

    #[test]
    fn ids_are_unique() {
        let a = Event::new(EventMode::AutoReset);
        let b = Event::new(EventMode::AutoReset);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn wait_blocks_until_triggered() {
        let event = Arc::new(Event::new(EventMode::ManualReset));

        let waiter = {
            let event = Arc::clone(&event);
            std::thread::spawn(move || event.wait())
        };

        std::thread::sleep(std::time::Duration::from_millis(10));
        event.trigger();
        waiter.join().unwrap();
        assert!(event.is_signaled());
    }

    #[test]
    fn auto_reset_releases_exactly_one_waiter_per_trigger() {
        const WAITERS: usize = 4;

        let event = Arc::new(Event::new(EventMode::AutoReset));
        let done = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..WAITERS)
            .map(|_| {
                let event = Arc::clone(&event);
                let done = Arc::clone(&done);
                std::thread::spawn(move || {
                    event.wait();
                    done.fetch_add(1, Ordering::AcqRel);
                })
            })
            .collect();

        for expected in 1..=WAITERS {
            std::thread::sleep(std::time::Duration::from_millis(10));
            event.trigger();
            while done.load(Ordering::Acquire) < expected {
                std::thread::yield_now();
            }
            // one trigger, at most one release
            assert_eq!(done.load(Ordering::Acquire), expected);
        }

        for handle in handles {
            handle.join().unwrap();
        }
    }

    // Two threads ping-pong through a pair of auto-reset events.
    #[test]
    fn ping_pong() {
        const ROUNDS: usize = 1000;

        let e1 = Arc::new(Event::new(EventMode::AutoReset));
        let e2 = Arc::new(Event::new(EventMode::AutoReset));

        let t1 = {
            let (e1, e2) = (Arc::clone(&e1), Arc::clone(&e2));
            std::thread::spawn(move || {
                for _ in 0..ROUNDS {
                    e1.trigger();
                    e2.wait();
                }
            })
        };
        let t2 = {
            let (e1, e2) = (Arc::clone(&e1), Arc::clone(&e2));
            std::thread::spawn(move || {
                for _ in 0..ROUNDS {
                    e1.wait();
                    e2.trigger();
                }
            })
        };

        t1.join().unwrap();
        t2.join().unwrap();
    }
}
