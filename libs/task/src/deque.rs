// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Bounded work-stealing deque ([Chase-Lev]).
//!
//! The owning worker pushes and pops at the bottom (LIFO, keeps recently
//! spawned work hot in its cache); stealers take from the top (FIFO, oldest
//! work first) with one bounded compare-exchange per attempt. A full deque
//! rejects the push and the caller overflows into the global queues.
//!
//! [Chase-Lev]: https://www.dre.vanderbilt.edu/~schmidt/PDF/work-stealing-dequeue.pdf

use core::marker::PhantomData;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicIsize, AtomicPtr, Ordering, fence};
use util::{CachePadded, non_null};

/// Outcome of a [`StealDeque::steal`] attempt.
#[derive(Debug)]
pub(crate) enum Steal<T> {
    Success(NonNull<T>),
    Empty,
    /// Lost a race with the owner or another stealer; worth retrying.
    Retry,
}

/// A fixed-capacity Chase-Lev deque of raw pointers.
///
/// `push` and `pop` may only be called by the owning worker; `steal` by
/// anyone. Pointers are opaque to the deque, ownership stays with the
/// caller.
pub(crate) struct StealDeque<T> {
    top: CachePadded<AtomicIsize>,
    bottom: CachePadded<AtomicIsize>,
    buffer: Box<[AtomicPtr<T>]>,
    capacity: isize,
    _marker: PhantomData<*mut T>,
}

// Safety: slots are atomics and the pointers are plain values here.
unsafe impl<T> Send for StealDeque<T> {}
// Safety: as above; the owner-only contract on push/pop is upheld by the
// scheduler, which never shares a worker's own end.
unsafe impl<T> Sync for StealDeque<T> {}

// === impl StealDeque ===

impl<T> StealDeque<T> {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two());
        Self {
            top: CachePadded::new(AtomicIsize::new(0)),
            bottom: CachePadded::new(AtomicIsize::new(0)),
            buffer: (0..capacity)
                .map(|_| AtomicPtr::new(core::ptr::null_mut()))
                .collect(),
            capacity: isize::try_from(capacity).expect("deque capacity fits isize"),
            _marker: PhantomData,
        }
    }

    #[expect(
        clippy::cast_sign_loss,
        reason = "slots are only read for indices in [top, bottom), which are non-negative"
    )]
    fn slot(&self, index: isize) -> &AtomicPtr<T> {
        let mask = self.buffer.len() - 1;
        &self.buffer[(index as usize) & mask]
    }

    /// Pushes at the bottom. Owner only.
    ///
    /// # Errors
    ///
    /// Hands the item back when the deque is full; the caller overflows it
    /// elsewhere.
    pub(crate) fn push(&self, item: NonNull<T>) -> Result<(), NonNull<T>> {
        let bottom = self.bottom.load(Ordering::Relaxed);
        let top = self.top.load(Ordering::Acquire);

        if bottom - top >= self.capacity {
            return Err(item);
        }

        self.slot(bottom).store(item.as_ptr(), Ordering::Relaxed);
        self.bottom.store(bottom + 1, Ordering::Release);
        Ok(())
    }

    /// Pops at the bottom (most recently pushed). Owner only.
    pub(crate) fn pop(&self) -> Option<NonNull<T>> {
        let bottom = self.bottom.load(Ordering::Relaxed) - 1;
        self.bottom.store(bottom, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        let top = self.top.load(Ordering::Relaxed);

        if top <= bottom {
            let item = self.slot(bottom).load(Ordering::Relaxed);
            if top == bottom {
                // Last element; a stealer may be taking it right now.
                let won = self
                    .top
                    .compare_exchange(top, top + 1, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok();
                self.bottom.store(bottom + 1, Ordering::Relaxed);
                // Safety: the deque never stores null.
                return won.then(|| unsafe { non_null(item) });
            }
            // Safety: as above.
            Some(unsafe { non_null(item) })
        } else {
            self.bottom.store(bottom + 1, Ordering::Relaxed);
            None
        }
    }

    /// Steals from the top (oldest). Any thread.
    pub(crate) fn steal(&self) -> Steal<T> {
        let top = self.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let bottom = self.bottom.load(Ordering::Acquire);

        if top >= bottom {
            return Steal::Empty;
        }

        // Read before the claim; a failed claim discards the read.
        let item = self.slot(top).load(Ordering::Relaxed);
        if self
            .top
            .compare_exchange(top, top + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            // Safety: the deque never stores null.
            Steal::Success(unsafe { non_null(item) })
        } else {
            Steal::Retry
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        let bottom = self.bottom.load(Ordering::Relaxed);
        let top = self.top.load(Ordering::Relaxed);
        top >= bottom
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn leak(v: u64) -> NonNull<u64> {
        NonNull::from(Box::leak(Box::new(v)))
    }

    fn reclaim(p: NonNull<u64>) -> u64 {
        // Safety: produced by `leak`
        *unsafe { Box::from_raw(p.as_ptr()) }
    }

    #[test]
    fn owner_sees_lifo_order() {
        let deque = StealDeque::with_capacity(64);
        for v in 0..10 {
            deque.push(leak(v)).unwrap();
        }
        for v in (0..10).rev() {
            assert_eq!(reclaim(deque.pop().unwrap()), v);
        }
        assert!(deque.pop().is_none());
    }

    #[test]
    fn stealers_see_fifo_order() {
        let deque = StealDeque::with_capacity(64);
        for v in 0..10 {
            deque.push(leak(v)).unwrap();
        }
        for v in 0..10 {
            match deque.steal() {
                Steal::Success(p) => assert_eq!(reclaim(p), v),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(matches!(deque.steal(), Steal::Empty));
    }

    #[test]
    fn full_deque_rejects_the_push() {
        let deque = StealDeque::with_capacity(4);
        for v in 0..4 {
            deque.push(leak(v)).unwrap();
        }
        let overflow = leak(99);
        let rejected = deque.push(overflow).unwrap_err();
        assert_eq!(reclaim(rejected), 99);
        while deque.pop().is_some() {}
    }

    // Owner pops and a pack of thieves steal concurrently; every item is
    // taken exactly once.
    #[test]
    fn contended_ownership_is_exclusive() {
        const ITEMS: u64 = 50_000;
        const THIEVES: usize = 3;

        let deque = Arc::new(StealDeque::with_capacity(256));
        let (owner_tx, collect_rx) = std::sync::mpsc::channel::<u64>();

        let thieves: Vec<_> = (0..THIEVES)
            .map(|_| {
                let deque = Arc::clone(&deque);
                let tx = owner_tx.clone();
                std::thread::spawn(move || {
                    loop {
                        match deque.steal() {
                            Steal::Success(p) => {
                                let v = reclaim(p);
                                if v == u64::MAX {
                                    break;
                                }
                                tx.send(v).unwrap();
                            }
                            Steal::Empty | Steal::Retry => std::thread::yield_now(),
                        }
                    }
                })
            })
            .collect();

        let mut next = 0;
        while next < ITEMS {
            if deque.push(leak(next)).is_ok() {
                next += 1;
            } else if let Some(p) = deque.pop() {
                owner_tx.send(reclaim(p)).unwrap();
            }
        }
        while let Some(p) = deque.pop() {
            owner_tx.send(reclaim(p)).unwrap();
        }
        // poison pills to stop the thieves
        for _ in 0..THIEVES {
            while deque.push(leak(u64::MAX)).is_err() {
                std::thread::yield_now();
            }
        }
        for thief in thieves {
            thief.join().unwrap();
        }
        drop(owner_tx);

        let mut seen = HashSet::new();
        while let Ok(v) = collect_rx.recv() {
            assert!(seen.insert(v), "item {v} taken twice");
        }
        assert_eq!(seen.len() as u64, ITEMS);
    }
}
