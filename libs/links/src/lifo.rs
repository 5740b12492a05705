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
use util::non_null;

/// A lock-free LIFO stack of raw links.
///
/// The head is a full [`LinkRef`] (index plus generation), so a
/// compare-exchange against a head whose link has been recycled in the
/// meantime fails on the generation bits. This is the ABA guard every list in
/// this crate relies on.
///
/// `LifoRoot` moves bare links; it is the building block for the bundle free
/// list and for [`LifoList`], which adds a payload per node.
#[derive(Debug)]
pub struct LifoRoot {
    head: AtomicU64,
}

// === impl LifoRoot ===

impl LifoRoot {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            head: AtomicU64::new(0),
        }
    }

    /// Pushes a link whose `single_next` field is free for chaining.
    pub fn push(&self, link: LinkRef) {
        let entry = deref_link(link);
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            entry.set_single_next(LinkRef::from_bits(head));
            match self.head.compare_exchange_weak(
                head,
                link.raw(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    /// Pops the most recently pushed link, clearing its chain field.
    pub fn pop(&self) -> Option<LinkRef> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let head_ref = LinkRef::from_bits(head);
            if head_ref.is_null() {
                return None;
            }
            // Reading the next field of a link that a concurrent pop has
            // already recycled is fine: the memory stays a live `Link` and
            // the compare-exchange below fails on the stale generation.
            let next = deref_link(head_ref).single_next();
            match self.head.compare_exchange_weak(
                head,
                next.raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    deref_link(head_ref).set_single_next(LinkRef::NULL);
                    return Some(head_ref);
                }
                Err(actual) => head = actual,
            }
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        LinkRef::from_bits(self.head.load(Ordering::Relaxed)).is_null()
    }
}

impl Default for LifoRoot {
    fn default() -> Self {
        Self::new()
    }
}

/// A lock-free LIFO stack of payload pointers.
///
/// Each `push` allocates a link from the bundle cache and stores the pointer
/// in its payload slot; `pop` recycles the link. Used wherever the engine
/// keeps an unordered free list of reusable objects (pooled events, stack
/// nodes).
#[derive(Debug)]
pub struct LifoList<T> {
    root: LifoRoot,
    _elements: PhantomData<*mut T>,
}

// Payload pointers are moved across threads as plain values.
//
// Safety: the list never dereferences payloads, it only stores them; `Send`
// of the pointee is the caller's contract.
unsafe impl<T> Send for LifoList<T> {}
// Safety: as above, all shared mutation goes through atomics.
unsafe impl<T> Sync for LifoList<T> {}

// === impl LifoList ===

impl<T> LifoList<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            root: LifoRoot::new(),
            _elements: PhantomData,
        }
    }

    pub fn push(&self, value: NonNull<T>) {
        let link = alloc_link();
        deref_link(link).set_payload(value.as_ptr().cast());
        self.root.push(link);
    }

    pub fn pop(&self) -> Option<NonNull<T>> {
        let link = self.root.pop()?;
        let entry = deref_link(link);
        let payload = entry.payload().cast::<T>();
        entry.set_payload(core::ptr::null_mut());
        free_link(link);
        // Safety: push only accepts NonNull payloads and pop clears the slot,
        // so a non-null payload is guaranteed here.
        Some(unsafe { non_null(payload) })
    }

    /// Atomically takes the whole stack and hands every payload to `f`, most
    /// recently pushed first.
    pub fn pop_all(&self, mut f: impl FnMut(NonNull<T>)) {
        let mut head = LinkRef::from_bits(self.root.head.swap(0, Ordering::AcqRel));
        while !head.is_null() {
            let entry = deref_link(head);
            let next = entry.single_next();
            let payload = entry.payload().cast::<T>();
            entry.set_payload(core::ptr::null_mut());
            entry.set_single_next(LinkRef::NULL);
            free_link(head);
            // Safety: push only accepts NonNull payloads.
            f(unsafe { non_null(payload) });
            head = next;
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }
}

impl<T> Default for LifoList<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU64 as StdAtomicU64;

    fn leak(v: u64) -> NonNull<u64> {
        NonNull::from(Box::leak(Box::new(v)))
    }

    fn reclaim(p: NonNull<u64>) -> u64 {
        // Safety: produced by `leak` above
        *unsafe { Box::from_raw(p.as_ptr()) }
    }

    #[test]
    fn push_pop_is_lifo() {
        let list = LifoList::new();
        list.push(leak(1));
        list.push(leak(2));
        list.push(leak(3));

        assert_eq!(reclaim(list.pop().unwrap()), 3);
        assert_eq!(reclaim(list.pop().unwrap()), 2);
        assert_eq!(reclaim(list.pop().unwrap()), 1);
        assert!(list.pop().is_none());
    }

    #[test]
    fn pop_all_drains_everything() {
        let list = LifoList::new();
        for v in 0..10 {
            list.push(leak(v));
        }

        let mut seen = Vec::new();
        list.pop_all(|p| seen.push(reclaim(p)));

        assert_eq!(seen, (0..10).rev().collect::<Vec<_>>());
        assert!(list.is_empty());
    }

    // Two threads hammering push/pop pairs on a shared stack; every popped
    // value must be one that was pushed, and the stack must drain clean.
    #[test]
    fn aba_stress() {
        const ITERS: u64 = 100_000;

        let list = Arc::new(LifoList::new());
        let bogus = Arc::new(StdAtomicU64::new(0));

        let handles: Vec<_> = (0..2u64)
            .map(|t| {
                let list = Arc::clone(&list);
                let bogus = Arc::clone(&bogus);
                std::thread::spawn(move || {
                    for i in 0..ITERS {
                        let id = t * ITERS + i;
                        list.push(leak(id));
                        if let Some(p) = list.pop() {
                            let v = reclaim(p);
                            if v >= 2 * ITERS {
                                bogus.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                            }
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(bogus.load(std::sync::atomic::Ordering::Relaxed), 0);

        // Each thread popped at most what it pushed; whatever remains must be
        // distinct ids that were genuinely pushed.
        let mut rest = HashSet::new();
        list.pop_all(|p| {
            let v = reclaim(p);
            assert!(v < 2 * ITERS);
            assert!(rest.insert(v), "value popped twice");
        });
    }
}
