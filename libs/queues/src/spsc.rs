// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Fast single-producer/single-consumer unbounded queue.
//!
//! Neither side ever needs a compare-exchange: the producer owns the head of
//! the list, the consumer owns the tail, and the only shared state is the
//! tail pointer and a length counter. Consumed nodes are not freed, the
//! producer recycles them through a node cache, so a queue at steady state
//! allocates nothing.

use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
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
}

struct Shared<T> {
    /// Oldest node not yet consumed; the consumer's end of the queue.
    tail: CachePadded<AtomicPtr<Node<T>>>,
    len: AtomicUsize,
    /// Oldest node of the producer's recycle cache, stashed here when the
    /// producer handle drops so teardown can free the whole chain.
    first: AtomicPtr<Node<T>>,
}

// Safety: values are moved through the queue; all shared state is atomic.
unsafe impl<T: Send> Send for Shared<T> {}
// Safety: as above.
unsafe impl<T: Send> Sync for Shared<T> {}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        // Both handles are gone: the producer stashed its cache head on drop,
        // and nothing concurrent remains. Nodes up to and including the tail
        // are unoccupied; values live strictly after it.
        let tail = self.tail.load(Ordering::Relaxed);
        let mut node = self.first.load(Ordering::Relaxed);
        let mut occupied = false;

        while !node.is_null() {
            // Safety: every node in the chain came from `Node::alloc` and is
            // owned solely by this destructor now.
            let boxed = unsafe { Box::from_raw(node) };
            let next = boxed.next.load(Ordering::Relaxed);
            if occupied {
                // Safety: nodes after the tail hold initialized values that
                // were never dequeued.
                boxed.value.with_mut(|v| unsafe { (*v).assume_init_drop() });
            }
            if node == tail {
                occupied = true;
            }
            node = next;
        }
    }
}

/// The sending half of an SPSC queue. `Send`, not `Clone`.
pub struct Producer<T> {
    shared: Arc<Shared<T>>,
    /// Newest node in the queue; only this handle touches it.
    head: *mut Node<T>,
    /// Node cache: `[first, tail_copy)` are consumed nodes free for reuse.
    first: *mut Node<T>,
    tail_copy: *mut Node<T>,
}

// Safety: the raw pointers are owned exclusively by this handle.
unsafe impl<T: Send> Send for Producer<T> {}

/// The receiving half of an SPSC queue. `Send`, not `Clone`.
pub struct Consumer<T> {
    shared: Arc<Shared<T>>,
}

// Safety: the consumer only touches the shared tail, which is atomic.
unsafe impl<T: Send> Send for Consumer<T> {}

/// Creates an unbounded SPSC queue, returning its two halves.
#[must_use]
pub fn queue<T>() -> (Producer<T>, Consumer<T>) {
    let sentinel = Node::<T>::alloc();
    let shared = Arc::new(Shared {
        tail: CachePadded::new(AtomicPtr::new(sentinel)),
        len: AtomicUsize::new(0),
        first: AtomicPtr::new(sentinel),
    });

    (
        Producer {
            shared: Arc::clone(&shared),
            head: sentinel,
            first: sentinel,
            tail_copy: sentinel,
        },
        Consumer { shared },
    )
}

// === impl Producer ===

impl<T> Producer<T> {
    pub fn enqueue(&mut self, value: T) {
        let node = self.alloc_node();
        // Safety: `node` is not yet linked, no other thread can see it.
        unsafe { (*node).value.with_mut(|v| (*v).write(value)) };

        // Publish: the consumer's Acquire load of `next` pairs with this.
        // Safety: `head` is always a valid node owned by the producer side.
        unsafe { (*self.head).next.store(node, Ordering::Release) };
        self.head = node;
        self.shared.len.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.len.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reuses a consumed node if one is available, otherwise allocates.
    fn alloc_node(&mut self) -> *mut Node<T> {
        if self.first != self.tail_copy {
            return self.take_cached();
        }
        // Refresh the local tail snapshot; the consumer may have moved on.
        self.tail_copy = self.shared.tail.load(Ordering::Acquire);
        if self.first != self.tail_copy {
            return self.take_cached();
        }
        Node::alloc()
    }

    fn take_cached(&mut self) -> *mut Node<T> {
        let node = self.first;
        // Safety: nodes in `[first, tail_copy)` were consumed and are only
        // reachable by the producer.
        unsafe {
            self.first = (*node).next.load(Ordering::Relaxed);
            (*node).next.store(ptr::null_mut(), Ordering::Relaxed);
        }
        node
    }
}

impl<T> Drop for Producer<T> {
    fn drop(&mut self) {
        self.shared.first.store(self.first, Ordering::Release);
    }
}

// === impl Consumer ===

impl<T> Consumer<T> {
    pub fn dequeue(&mut self) -> Option<T> {
        let tail = self.shared.tail.load(Ordering::Relaxed);
        // Safety: the tail node is never freed or recycled while this handle
        // exists.
        let next = unsafe { (*tail).next.load(Ordering::Acquire) };
        if next.is_null() {
            return None;
        }

        // Safety: `next` was published by the producer with Release, so its
        // value is initialized and visible.
        let value = unsafe { (*next).value.with_mut(|v| (*v).assume_init_read()) };

        // The old tail becomes recyclable by the producer.
        self.shared.tail.store(next, Ordering::Release);
        self.shared.len.fetch_sub(1, Ordering::Relaxed);
        Some(value)
    }

    /// A reference to the oldest queued value without removing it.
    #[must_use]
    pub fn peek(&mut self) -> Option<&T> {
        let tail = self.shared.tail.load(Ordering::Relaxed);
        // Safety: see `dequeue`.
        let next = unsafe { (*tail).next.load(Ordering::Acquire) };
        if next.is_null() {
            return None;
        }
        // Safety: the value is initialized (published by the producer) and
        // cannot be moved out while `self` is mutably borrowed.
        Some(unsafe { &*(*next).value.with(|v| v.cast::<T>()) })
    }

    /// Iterates the queued values oldest-first without removing them.
    ///
    /// The producer may keep appending during iteration; late items may or
    /// may not be observed.
    pub fn iter(&mut self) -> Iter<'_, T> {
        let tail = self.shared.tail.load(Ordering::Relaxed);
        // Safety: see `dequeue`.
        let current = unsafe { (*tail).next.load(Ordering::Acquire) };
        Iter {
            current,
            _consumer: self,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.len.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Consumer-side iterator over queued values, oldest first.
pub struct Iter<'a, T> {
    current: *mut Node<T>,
    _consumer: &'a mut Consumer<T>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current.is_null() {
            return None;
        }
        // Safety: occupied nodes stay allocated and initialized while the
        // consumer is mutably borrowed by this iterator.
        let value = unsafe { &*(*self.current).value.with(|v| v.cast::<T>()) };
        // Safety: as above.
        self.current = unsafe { (*self.current).next.load(Ordering::Acquire) };
        Some(value)
    }
}
