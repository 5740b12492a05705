// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::link_ref::LinkRef;
use crate::pool::{alloc_link, deref_link, free_link};
use core::marker::PhantomData;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};
use util::{CachePadded, non_null};

/// A lock-free FIFO queue of payload pointers.
///
/// Michael-Scott shape on the link substrate: `head` and `tail` are
/// [`LinkRef`]s whose counter bits advance on every successful
/// compare-exchange, and a permanent sentinel link avoids special-casing the
/// empty queue. Nodes chain through the counter-carrying `double_next` field,
/// so an enqueue racing a dequeue that recycles the tail fails its
/// compare-exchange instead of losing the item.
///
/// Safe for multiple producers and multiple consumers.
#[derive(Debug)]
pub struct FifoList<T> {
    head: CachePadded<AtomicU64>,
    tail: CachePadded<AtomicU64>,
    _elements: PhantomData<*mut T>,
}

// Safety: payloads are moved as plain pointers, never dereferenced here.
unsafe impl<T> Send for FifoList<T> {}
// Safety: as above, all shared mutation goes through atomics.
unsafe impl<T> Sync for FifoList<T> {}

// === impl FifoList ===

impl<T> FifoList<T> {
    /// Creates an empty queue, allocating its sentinel link.
    #[must_use]
    pub fn new() -> Self {
        let sentinel = alloc_link();
        Self {
            head: CachePadded::new(AtomicU64::new(sentinel.raw())),
            tail: CachePadded::new(AtomicU64::new(sentinel.raw())),
            _elements: PhantomData,
        }
    }

    pub fn push(&self, value: NonNull<T>) {
        let item = alloc_link();
        deref_link(item).set_payload(value.as_ptr().cast());

        loop {
            let tail = LinkRef::from_bits(self.tail.load(Ordering::Acquire));
            let tail_entry = deref_link(tail);
            let next = tail_entry.double_next();

            // The tail may have been recycled under us; the double-check
            // keeps the failure path cheap, the counter on `double_next`
            // keeps it correct.
            if self.tail.load(Ordering::Acquire) != tail.raw() {
                continue;
            }

            if next.is_null() {
                let new_next = LinkRef::new_indexed(item.index(), next.counter() + 1);
                if tail_entry.compare_exchange_double_next(next, new_next).is_ok() {
                    // Swing the tail; losing this race just means someone
                    // else already helped.
                    let _ = self.tail.compare_exchange(
                        tail.raw(),
                        LinkRef::new_indexed(item.index(), tail.counter() + 1).raw(),
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    );
                    return;
                }
            } else {
                // Tail is lagging, help it along.
                let _ = self.tail.compare_exchange(
                    tail.raw(),
                    LinkRef::new_indexed(next.index(), tail.counter() + 1).raw(),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                );
            }
        }
    }

    pub fn pop(&self) -> Option<NonNull<T>> {
        loop {
            let head = LinkRef::from_bits(self.head.load(Ordering::Acquire));
            let head_entry = deref_link(head);
            let next = head_entry.double_next();

            if self.head.load(Ordering::Acquire) != head.raw() {
                continue;
            }

            if next.is_null() {
                return None;
            }

            let tail = LinkRef::from_bits(self.tail.load(Ordering::Acquire));
            if tail.index() == head.index() {
                // Tail is lagging behind the node we are about to unlink.
                let _ = self.tail.compare_exchange(
                    tail.raw(),
                    LinkRef::new_indexed(next.index(), tail.counter() + 1).raw(),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                );
            }

            // Read the payload before the head moves; if the compare-exchange
            // below fails this value is simply discarded.
            let payload = deref_link(next).payload().cast::<T>();

            if self
                .head
                .compare_exchange(
                    head.raw(),
                    LinkRef::new_indexed(next.index(), head.counter() + 1).raw(),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                // The old sentinel is ours alone now.
                free_link(head);
                // Safety: push stores only NonNull payloads.
                return Some(unsafe { non_null(payload) });
            }
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        let head = LinkRef::from_bits(self.head.load(Ordering::Acquire));
        deref_link(head).double_next().is_null()
    }
}

impl<T> Default for FifoList<T> {
    fn default() -> Self {
        Self::new()
    }
}
