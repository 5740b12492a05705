// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{AtomicPtr, Ordering};
use core::mem::MaybeUninit;
use core::ptr;
use util::CachePadded;

/// Multi-producer/single-consumer unbounded queue that can be consumed only
/// once.
///
/// [`close`](Self::close) atomically closes the queue and drains every item
/// enqueued so far in FIFO order. An enqueue that races the close either
/// lands in the drained set or is rejected whole back to its producer; no
/// item is ever both delivered and rejected, and none is lost.
///
/// The engine uses this shape for subscriber lists that are delivered once,
/// such as the subsequents of a completing task.
pub struct ClosableMpscQueue<T> {
    /// Most recently enqueued node; null once closed.
    head: CachePadded<AtomicPtr<Node<T>>>,
    /// Permanent starting point of the chain; freed during close (or drop).
    sentinel: *mut Node<T>,
}

struct Node<T> {
    next: AtomicPtr<Node<T>>,
    value: UnsafeCell<MaybeUninit<T>>,
}

// Safety: values are moved through the queue; all shared state is atomic.
unsafe impl<T: Send> Send for ClosableMpscQueue<T> {}
// Safety: as above.
unsafe impl<T: Send> Sync for ClosableMpscQueue<T> {}

impl<T> Node<T> {
    fn alloc() -> *mut Self {
        Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }))
    }
}

// === impl ClosableMpscQueue ===

impl<T> ClosableMpscQueue<T> {
    #[must_use]
    pub fn new() -> Self {
        let sentinel = Node::<T>::alloc();
        Self {
            head: CachePadded::new(AtomicPtr::new(sentinel)),
            sentinel,
        }
    }

    /// Enqueues a value unless the queue is closed.
    ///
    /// # Errors
    ///
    /// Returns the value back if the queue was closed before the enqueue
    /// could land.
    pub fn enqueue(&self, value: T) -> Result<(), T> {
        let mut prev = self.head.load(Ordering::Acquire);
        if prev.is_null() {
            return Err(value);
        }

        let node = Node::alloc();
        // Safety: the node is not yet shared.
        unsafe { (*node).value.with_mut(|v| (*v).write(value)) };

        // Linearization point: land on the head, or observe the close.
        loop {
            match self.head.compare_exchange_weak(
                prev,
                node,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) if actual.is_null() => {
                    // Closed while we were trying; hand the value back.
                    // Safety: the node never became reachable.
                    let value =
                        unsafe { (*node).value.with_mut(|v| (*v).assume_init_read()) };
                    // Safety: as above, ours alone.
                    drop(unsafe { Box::from_raw(node) });
                    tracing::trace!("enqueue rejected, queue closed");
                    return Err(value);
                }
                Err(actual) => prev = actual,
            }
        }

        // Link the previous head to us. Until this store lands the chain has
        // a gap that `close` spins over.
        // Safety: `prev` stays allocated; the closing consumer frees nodes
        // only after observing this link.
        unsafe { (*prev).next.store(node, Ordering::Release) };
        Ok(())
    }

    /// Closes the queue and hands every enqueued value to `consumer` in FIFO
    /// order. Returns `false` if the queue was already closed.
    pub fn close(&self, mut consumer: impl FnMut(T)) -> bool {
        // Capture the head at the moment of closing; it may still be
        // unreachable from the sentinel while producers finish linking.
        let head = self.head.swap(ptr::null_mut(), Ordering::AcqRel);
        if head.is_null() {
            return false;
        }

        let sentinel = self.sentinel;
        if head == sentinel {
            // Never enqueued.
            // Safety: closed queues are never traversed again.
            drop(unsafe { Box::from_raw(sentinel) });
            return true;
        }

        // Producers may still be mid-link; spin until the next pointer
        // appears. A producer that lost the head race rejects instead, so
        // every link in `[sentinel, head]` will materialize.
        let get_next = |node: *mut Node<T>| loop {
            // Safety: nodes between sentinel and head stay allocated until
            // this drain frees them.
            let next = unsafe { (*node).next.load(Ordering::Acquire) };
            if !next.is_null() {
                break next;
            }
            #[cfg(all(loom, test))]
            crate::loom::thread::yield_now();
            core::hint::spin_loop();
        };

        let mut consume = |node: *mut Node<T>| {
            // Safety: fully linked nodes hold initialized values and are
            // exclusively ours after the close.
            let value = unsafe { (*node).value.with_mut(|v| (*v).assume_init_read()) };
            // Safety: as above.
            drop(unsafe { Box::from_raw(node) });
            consumer(value);
        };

        // Skip the sentinel outside the loop to avoid the empty-case branch.
        let mut node = get_next(sentinel);
        // Safety: the sentinel is ours alone after the swap above.
        drop(unsafe { Box::from_raw(sentinel) });

        while node != head {
            let next = get_next(node);
            consume(node);
            node = next;
        }
        consume(head);
        true
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.head.load(Ordering::Relaxed).is_null()
    }
}

impl<T> Default for ClosableMpscQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for ClosableMpscQueue<T> {
    fn drop(&mut self) {
        if self.head.load(Ordering::Relaxed).is_null() {
            // Closed: the drain already freed the chain.
            return;
        }

        // Never closed. No producers remain, so the chain is fully linked.
        // Safety: exclusive access; nodes come from `Node::alloc`.
        unsafe {
            let mut node = (*self.sentinel).next.load(Ordering::Relaxed);
            drop(Box::from_raw(self.sentinel));
            while !node.is_null() {
                let boxed = Box::from_raw(node);
                let next = boxed.next.load(Ordering::Relaxed);
                boxed.value.with_mut(|v| (*v).assume_init_drop());
                node = next;
            }
        }
    }
}
