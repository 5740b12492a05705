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

/// Whether a [`ConsumeAllMpmcQueue`] operation found the queue empty.
///
/// Producers use this to decide whether a consumer needs to be scheduled:
/// only the producer that turned the queue non-empty has to act.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProduceResult {
    WasEmpty,
    HadItems,
}

/// Multi-producer/multi-consumer unbounded queue (implemented as a stack)
/// whose only consume operation atomically takes everything at once.
///
/// Suited for drain-at-the-frame-boundary patterns where many threads
/// accumulate work and one sweep processes it. Consuming in FIFO order costs
/// one link reversal over the captured chain.
pub struct ConsumeAllMpmcQueue<T> {
    head: CachePadded<AtomicPtr<Node<T>>>,
}

struct Node<T> {
    next: AtomicPtr<Node<T>>,
    value: UnsafeCell<MaybeUninit<T>>,
}

// Safety: values are moved through the queue; all shared state is atomic.
unsafe impl<T: Send> Send for ConsumeAllMpmcQueue<T> {}
// Safety: as above.
unsafe impl<T: Send> Sync for ConsumeAllMpmcQueue<T> {}

// === impl ConsumeAllMpmcQueue ===

impl<T> ConsumeAllMpmcQueue<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            head: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
        }
    }

    /// Pushes a value, reporting whether the queue was empty beforehand.
    pub fn produce(&self, value: T) -> ProduceResult {
        let node = Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }));
        // Safety: the node is not yet shared.
        unsafe { (*node).value.with_mut(|v| (*v).write(value)) };

        let mut prev = self.head.load(Ordering::Relaxed);
        loop {
            // Safety: `node` is still unshared until the compare-exchange.
            unsafe { (*node).next.store(prev, Ordering::Relaxed) };
            match self
                .head
                .compare_exchange_weak(prev, node, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => prev = actual,
            }
        }

        if prev.is_null() {
            ProduceResult::WasEmpty
        } else {
            ProduceResult::HadItems
        }
    }

    /// Takes the whole queue atomically and consumes it newest-first.
    pub fn consume_all_lifo(&self, consumer: impl FnMut(T)) -> ProduceResult {
        self.consume_all(false, consumer)
    }

    /// Takes the whole queue atomically and consumes it oldest-first, at the
    /// cost of reversing the links once.
    pub fn consume_all_fifo(&self, consumer: impl FnMut(T)) -> ProduceResult {
        self.consume_all(true, consumer)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Relaxed).is_null()
    }

    fn consume_all(&self, reverse: bool, mut consumer: impl FnMut(T)) -> ProduceResult {
        // Pop the entire stack in one go.
        let mut node = self.head.swap(ptr::null_mut(), Ordering::AcqRel);
        if node.is_null() {
            return ProduceResult::WasEmpty;
        }

        if reverse {
            // Per-node atomic exchange keeps the happens-before the producers
            // established on each link.
            let mut prev: *mut Node<T> = ptr::null_mut();
            while !node.is_null() {
                let tmp = node;
                // Safety: the captured chain is exclusively ours.
                node = unsafe { (*node).next.swap(prev, Ordering::Relaxed) };
                prev = tmp;
            }
            node = prev;
        }

        while !node.is_null() {
            // Safety: exclusive access to the captured chain; values were
            // initialized before the producing compare-exchange.
            let boxed = unsafe { Box::from_raw(node) };
            let next = boxed.next.load(Ordering::Relaxed);
            let value = boxed.value.with_mut(|v| unsafe { (*v).assume_init_read() });
            drop(boxed);
            consumer(value);
            node = next;
        }

        ProduceResult::HadItems
    }
}

impl<T> Default for ConsumeAllMpmcQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for ConsumeAllMpmcQueue<T> {
    fn drop(&mut self) {
        self.consume_all_lifo(drop);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom;
    use std::sync::Arc;

    #[test]
    fn lifo_and_fifo_orders() {
        let queue = ConsumeAllMpmcQueue::new();
        assert_eq!(queue.produce(1), ProduceResult::WasEmpty);
        assert_eq!(queue.produce(2), ProduceResult::HadItems);
        assert_eq!(queue.produce(3), ProduceResult::HadItems);

        let mut seen = Vec::new();
        assert_eq!(
            queue.consume_all_lifo(|v| seen.push(v)),
            ProduceResult::HadItems
        );
        assert_eq!(seen, vec![3, 2, 1]);

        // reset to empty, refill, drain oldest-first
        assert!(queue.is_empty());
        assert_eq!(queue.produce(4), ProduceResult::WasEmpty);
        queue.produce(5);
        queue.produce(6);

        seen.clear();
        assert_eq!(
            queue.consume_all_fifo(|v| seen.push(v)),
            ProduceResult::HadItems
        );
        assert_eq!(seen, vec![4, 5, 6]);

        assert_eq!(
            queue.consume_all_fifo(|_| panic!("queue is empty")),
            ProduceResult::WasEmpty
        );
    }

    #[test]
    fn dropped_values_are_freed() {
        let value = Arc::new(());
        let queue = ConsumeAllMpmcQueue::new();
        queue.produce(Arc::clone(&value));
        queue.produce(Arc::clone(&value));
        drop(queue);
        assert_eq!(Arc::strong_count(&value), 1);
    }

    #[test]
    fn concurrent_producers_all_arrive() {
        const PER_PRODUCER: usize = 10_000;
        const PRODUCERS: usize = 4;

        let queue = Arc::new(ConsumeAllMpmcQueue::new());

        let handles: Vec<_> = (0..PRODUCERS)
            .map(|t| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        queue.produce(t * PER_PRODUCER + i);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let mut seen = Vec::new();
        queue.consume_all_fifo(|v| seen.push(v));
        seen.sort_unstable();
        assert_eq!(seen, (0..PRODUCERS * PER_PRODUCER).collect::<Vec<_>>());
    }

    #[test]
    fn produce_races_consume_all() {
        loom::model(|| {
            let queue = Arc::new(ConsumeAllMpmcQueue::new());

            let producer = {
                let queue = Arc::clone(&queue);
                loom::thread::spawn(move || {
                    queue.produce(1);
                    queue.produce(2);
                })
            };

            let mut seen = Vec::new();
            queue.consume_all_fifo(|v| seen.push(v));
            producer.join().unwrap();
            queue.consume_all_fifo(|v| seen.push(v));

            seen.sort_unstable();
            assert_eq!(seen, vec![1, 2]);
        });
    }
}
