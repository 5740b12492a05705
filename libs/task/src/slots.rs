// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use util::CachePadded;

/// A bounded lock-free FIFO of concurrency-slot ids, initialized with
/// `[0..max_concurrency)`.
///
/// At every moment the ids held by executing tasks plus the ids resident
/// here partition `[0..max_concurrency)`.
///
/// FIFO rotation is deliberate: it round-robins the slots, keeping per-slot
/// scratch buffers warm for whichever tasks consistently draw from a slot,
/// and it cannot starve a slot the way a LIFO would under sustained load.
///
/// The ring is a bounded MPMC queue in the style of [Vyukov's array queue]:
/// each cell carries a sequence number that encodes whose turn it is.
///
/// [Vyukov's array queue]: http://www.1024cores.net/home/lock-free-algorithms/queues/bounded-mpmc-queue
pub(crate) struct ConcurrencySlots {
    cells: Box<[SlotCell]>,
    enqueue_pos: CachePadded<AtomicU64>,
    dequeue_pos: CachePadded<AtomicU64>,
}

struct SlotCell {
    sequence: AtomicU64,
    value: AtomicU32,
}

// === impl ConcurrencySlots ===

impl ConcurrencySlots {
    pub(crate) fn new(max_concurrency: u32) -> Self {
        assert!(max_concurrency > 0, "a limiter needs at least one slot");
        let capacity = (max_concurrency as usize).next_power_of_two();

        let slots = Self {
            cells: (0..capacity)
                .map(|i| SlotCell {
                    sequence: AtomicU64::new(i as u64),
                    value: AtomicU32::new(0),
                })
                .collect(),
            enqueue_pos: CachePadded::new(AtomicU64::new(0)),
            dequeue_pos: CachePadded::new(AtomicU64::new(0)),
        };

        for slot in 0..max_concurrency {
            slots.release(slot);
        }
        slots
    }

    /// Takes the least recently released slot, if any is free.
    pub(crate) fn alloc(&self) -> Option<u32> {
        let mask = self.cells.len() as u64 - 1;
        let mut pos = self.dequeue_pos.load(Ordering::Relaxed);
        loop {
            let cell = &self.cells[usize::try_from(pos & mask).expect("mask fits usize")];
            let sequence = cell.sequence.load(Ordering::Acquire);

            if sequence == pos + 1 {
                match self.dequeue_pos.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let value = cell.value.load(Ordering::Relaxed);
                        cell.sequence.store(pos + mask + 1, Ordering::Release);
                        return Some(value);
                    }
                    Err(actual) => pos = actual,
                }
            } else if sequence < pos + 1 {
                // The cell has not been released this lap: empty.
                return None;
            } else {
                pos = self.dequeue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Returns a slot to the back of the queue.
    pub(crate) fn release(&self, slot: u32) {
        let mask = self.cells.len() as u64 - 1;
        let mut pos = self.enqueue_pos.load(Ordering::Relaxed);
        loop {
            let cell = &self.cells[usize::try_from(pos & mask).expect("mask fits usize")];
            let sequence = cell.sequence.load(Ordering::Acquire);

            if sequence == pos {
                match self.enqueue_pos.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        cell.value.store(slot, Ordering::Relaxed);
                        cell.sequence.store(pos + 1, Ordering::Release);
                        return;
                    }
                    Err(actual) => pos = actual,
                }
            } else if sequence < pos {
                // More releases than slots exist; the partition invariant is
                // broken upstream.
                unreachable!("released a slot into a full slot queue");
            } else {
                pos = self.enqueue_pos.load(Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn starts_with_all_slots() {
        let slots = ConcurrencySlots::new(4);
        let taken: Vec<_> = (0..4).filter_map(|_| slots.alloc()).collect();
        assert_eq!(taken, vec![0, 1, 2, 3]);
        assert_eq!(slots.alloc(), None);
    }

    #[test]
    fn rotation_is_fifo() {
        let slots = ConcurrencySlots::new(3);
        let a = slots.alloc().unwrap();
        let b = slots.alloc().unwrap();
        slots.release(a);
        slots.release(b);
        // c was never taken and sits in front of the re-released a and b
        assert_eq!(slots.alloc(), Some(2));
        assert_eq!(slots.alloc(), Some(a));
        assert_eq!(slots.alloc(), Some(b));
    }

    #[test]
    fn non_power_of_two_counts_work() {
        let slots = ConcurrencySlots::new(5);
        let taken: HashSet<_> = (0..5).filter_map(|_| slots.alloc()).collect();
        assert_eq!(taken, (0..5).collect());
        assert_eq!(slots.alloc(), None);
    }

    // Hammer alloc/release from several threads; at no point may two threads
    // hold the same slot.
    #[test]
    fn slots_are_exclusive_under_contention() {
        const THREADS: usize = 4;
        const ITERS: usize = 50_000;

        let slots = Arc::new(ConcurrencySlots::new(2));
        let in_use: Arc<[std::sync::atomic::AtomicBool; 2]> = Arc::new([
            std::sync::atomic::AtomicBool::new(false),
            std::sync::atomic::AtomicBool::new(false),
        ]);

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let slots = Arc::clone(&slots);
                let in_use = Arc::clone(&in_use);
                std::thread::spawn(move || {
                    for _ in 0..ITERS {
                        if let Some(slot) = slots.alloc() {
                            let flag = &in_use[slot as usize];
                            assert!(
                                !flag.swap(true, Ordering::AcqRel),
                                "slot {slot} handed out twice"
                            );
                            flag.store(false, Ordering::Release);
                            slots.release(slot);
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let drained: HashSet<_> = (0..2).filter_map(|_| slots.alloc()).collect();
        assert_eq!(drained, (0..2).collect());
    }
}
