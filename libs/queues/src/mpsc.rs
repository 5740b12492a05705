// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Fast multi-producer/single-consumer unbounded queue.
//!
//! Producers swap themselves onto the head with a single atomic exchange and
//! then link the previous head to the new node; the consumer walks a private
//! tail pointer behind a permanent sentinel. Relative order of two producers'
//! items is decided by whichever exchange lands first.

use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{AtomicPtr, Ordering};
use core::mem::MaybeUninit;
use core::ptr;
use std::sync::Arc;
use util::CachePadded;

struct Node<T> {
    next: AtomicPtr<Node<T>>,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Node<T> {
    fn alloc() -> *mut Self {
        Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }))
    }

    fn alloc_with(value: T) -> *mut Self {
        let node = Self::alloc();
        // Safety: the node is not yet shared.
        unsafe { (*node).value.with_mut(|v| (*v).write(value)) };
        node
    }
}

struct Shared<T> {
    /// Most recently enqueued node; producers exchange themselves in here.
    head: CachePadded<AtomicPtr<Node<T>>>,
    /// The consumer's tail, stashed when the consumer handle drops so
    /// teardown can free the remaining chain.
    tail_stash: AtomicPtr<Node<T>>,
}

// Safety: values are moved through the queue; all shared state is atomic.
unsafe impl<T: Send> Send for Shared<T> {}
// Safety: as above.
unsafe impl<T: Send> Sync for Shared<T> {}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        // All handles are gone. The first node is the current sentinel whose
        // value was already consumed; everything after it is occupied.
        let mut node = self.tail_stash.load(Ordering::Relaxed);
        let mut occupied = false;

        while !node.is_null() {
            // Safety: the chain is exclusively ours now; nodes come from
            // `Node::alloc`.
            let boxed = unsafe { Box::from_raw(node) };
            let next = boxed.next.load(Ordering::Relaxed);
            if occupied {
                // Safety: non-sentinel nodes hold initialized values.
                boxed.value.with_mut(|v| unsafe { (*v).assume_init_drop() });
            }
            occupied = true;
            node = next;
        }
    }
}

/// The sending half of an MPSC queue. Clone one per producer thread.
pub struct Producer<T> {
    shared: Arc<Shared<T>>,
}

// Safety: enqueue only touches atomics and freshly-allocated nodes.
unsafe impl<T: Send> Send for Producer<T> {}
// Safety: as above, enqueue through `&self` is the point of this type.
unsafe impl<T: Send> Sync for Producer<T> {}

/// The receiving half of an MPSC queue. `Send`, not `Clone`.
pub struct Consumer<T> {
    shared: Arc<Shared<T>>,
    /// Current sentinel; only this handle reads past it.
    tail: *mut Node<T>,
}

// Safety: `tail` is owned exclusively by this handle.
unsafe impl<T: Send> Send for Consumer<T> {}

/// Creates an unbounded MPSC queue, returning its two halves.
#[must_use]
pub fn queue<T>() -> (Producer<T>, Consumer<T>) {
    let sentinel = Node::<T>::alloc();
    let shared = Arc::new(Shared {
        head: CachePadded::new(AtomicPtr::new(sentinel)),
        tail_stash: AtomicPtr::new(ptr::null_mut()),
    });

    (
        Producer {
            shared: Arc::clone(&shared),
        },
        Consumer {
            shared,
            tail: sentinel,
        },
    )
}

// === impl Producer ===

impl<T> Producer<T> {
    pub fn enqueue(&self, value: T) {
        let node = Node::alloc_with(value);

        // Linearization point: whoever exchanges first is ordered first.
        let prev = self.shared.head.swap(node, Ordering::AcqRel);
        // Safety: `prev` is a valid node; only this producer links its next
        // field, and the consumer spins on it being null.
        unsafe { (*prev).next.store(node, Ordering::Release) };
    }
}

impl<T> Clone for Producer<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

// === impl Consumer ===

impl<T> Consumer<T> {
    pub fn dequeue(&mut self) -> Option<T> {
        // Safety: the sentinel is owned by this handle and never freed by
        // anyone else.
        let next = unsafe { (*self.tail).next.load(Ordering::Acquire) };
        if next.is_null() {
            return None;
        }

        // Safety: `next` was fully initialized before the producer's Release
        // store made it reachable.
        let value = unsafe { (*next).value.with_mut(|v| (*v).assume_init_read()) };

        // Retire the old sentinel; `next` becomes the new one.
        // Safety: nothing else can reach the old sentinel anymore.
        drop(unsafe { Box::from_raw(self.tail) });
        self.tail = next;
        Some(value)
    }

    /// A reference to the oldest queued value without removing it.
    #[must_use]
    pub fn peek(&mut self) -> Option<&T> {
        // Safety: see `dequeue`.
        let next = unsafe { (*self.tail).next.load(Ordering::Acquire) };
        if next.is_null() {
            return None;
        }
        // Safety: initialized before publication; cannot be moved out while
        // `self` is mutably borrowed.
        Some(unsafe { &*(*next).value.with(|v| v.cast::<T>()) })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        // Safety: see `dequeue`.
        unsafe { (*self.tail).next.load(Ordering::Acquire) }.is_null()
    }
}

impl<T> Drop for Consumer<T> {
    fn drop(&mut self) {
        self.shared.tail_stash.store(self.tail, Ordering::Release);
    }
}
