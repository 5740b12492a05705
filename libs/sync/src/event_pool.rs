// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Pools of reusable events.
//!
//! Creating an event is cheap but not free (a fresh diagnostic id, an
//! allocation), and waits are frequent, so events are borrowed from a
//! per-mode global pool and returned on drop. The free list is a lock-free
//! LIFO on the link substrate; pooled events live for the rest of the
//! process.

use crate::event::{Event, EventMode};
use core::ops::Deref;
use core::ptr::NonNull;
use links::LifoList;
use std::sync::Arc;

static AUTO_RESET_POOL: LifoList<Event> = LifoList::new();
static MANUAL_RESET_POOL: LifoList<Event> = LifoList::new();

fn pool(mode: EventMode) -> &'static LifoList<Event> {
    match mode {
        EventMode::AutoReset => &AUTO_RESET_POOL,
        EventMode::ManualReset => &MANUAL_RESET_POOL,
    }
}

fn acquire_raw(mode: EventMode) -> &'static Event {
    if let Some(event) = pool(mode).pop() {
        // Safety: the pool only holds events leaked below; they are never
        // freed, and popping removes the only other reference.
        unsafe { event.as_ref() }
    } else {
        Box::leak(Box::new(Event::new(mode)))
    }
}

fn release_raw(event: &'static Event) {
    event.reset();
    pool(event.mode()).push(NonNull::from(event));
}

/// Borrows an event from the pool of its mode.
///
/// The returned [`EventRef`] hands the event back when dropped. For a handle
/// that can be shared between owners, convert it with
/// [`EventRef::into_shared`].
#[must_use]
pub fn acquire_event(mode: EventMode) -> EventRef {
    EventRef {
        event: acquire_raw(mode),
    }
}

/// An exclusive borrow of a pooled [`Event`]; returns it on drop.
///
/// Not clonable; clone-shaped use cases want [`SharedEventRef`].
#[derive(Debug)]
pub struct EventRef {
    event: &'static Event,
}

// === impl EventRef ===

impl EventRef {
    /// Converts this borrow into a shared, clonable handle.
    #[must_use]
    pub fn into_shared(self) -> SharedEventRef {
        let event = self.event;
        core::mem::forget(self);
        SharedEventRef {
            inner: Arc::new(PoolReturn { event }),
        }
    }
}

impl Deref for EventRef {
    type Target = Event;

    fn deref(&self) -> &Event {
        self.event
    }
}

impl Drop for EventRef {
    fn drop(&mut self) {
        release_raw(self.event);
    }
}

/// A shared borrow of a pooled [`Event`].
///
/// Clones share the same event; it returns to the pool when the last clone
/// drops.
#[derive(Debug, Clone)]
pub struct SharedEventRef {
    inner: Arc<PoolReturn>,
}

#[derive(Debug)]
struct PoolReturn {
    event: &'static Event,
}

impl Drop for PoolReturn {
    fn drop(&mut self) {
        release_raw(self.event);
    }
}

impl Deref for SharedEventRef {
    type Target = Event;

    fn deref(&self) -> &Event {
        self.inner.event
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The pools are global; serialize the tests that reason about reuse.
    static POOL_TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[test]
    fn released_events_are_reused() {
        let _serial = POOL_TEST_LOCK.lock().unwrap();
        let id = {
            let event = acquire_event(EventMode::AutoReset);
            event.trigger();
            event.id()
        };

        // Came back reset, and the slot is recycled.
        let event = acquire_event(EventMode::AutoReset);
        assert_eq!(event.id(), id);
        assert!(!event.is_signaled());
    }

    #[test]
    fn modes_draw_from_separate_pools() {
        let _serial = POOL_TEST_LOCK.lock().unwrap();
        let auto = acquire_event(EventMode::AutoReset);
        let manual = acquire_event(EventMode::ManualReset);
        assert_eq!(auto.mode(), EventMode::AutoReset);
        assert_eq!(manual.mode(), EventMode::ManualReset);
        assert_ne!(auto.id(), manual.id());
    }

    #[test]
    fn shared_ref_returns_on_last_drop() {
        let _serial = POOL_TEST_LOCK.lock().unwrap();
        let shared = acquire_event(EventMode::ManualReset).into_shared();
        let id = shared.id();
        let clone = shared.clone();
        clone.trigger();
        drop(shared);
        // Still signaled: the pool return only happens on last drop.
        assert!(clone.is_signaled());
        drop(clone);

        let event = acquire_event(EventMode::ManualReset);
        assert_eq!(event.id(), id);
        assert!(!event.is_signaled());
    }
}
