// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::lifo::LifoRoot;
use crate::link_ref::LinkRef;
use core::cell::Cell;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering};
use static_assertions::const_assert;
use util::CachePadded;

/// Links are handed out in blocks of this many; blocks are never returned to
/// the OS.
const LINKS_PER_BLOCK: u32 = 16 * 1024;

/// Hard cap on the pool's index space (~33M links).
const MAX_LINKS: u32 = 1 << 25;

const MAX_BLOCKS: usize = (MAX_LINKS / LINKS_PER_BLOCK) as usize;

/// Bundle granularity for the per-thread cache: one cache line of `LinkRef`s.
const LINKS_PER_BUNDLE: u32 = 64;

// The index space must fit the LinkRef encoding.
const_assert!((MAX_LINKS as u64) < (1 << 26));

// Free links chain LinkRef bits through their payload pointer.
const_assert!(core::mem::size_of::<*mut ()>() == 8);

/// One entry in the global link pool.
///
/// All fields hold [`LinkRef`] bits (or an opaque payload pointer), never raw
/// `Link` pointers. The counter bits of `double_next` double as the slot's
/// recycle generation: they survive while the link sits on a free list and
/// advance on every [`free_link`], which is what invalidates stale
/// `LinkRef`s.
#[derive(Debug)]
pub struct Link {
    /// Chain field for LIFO stacks and FIFO queues.
    single_next: AtomicU64,
    /// Chain field for doubly-linked structures; counter bits persist the
    /// slot's recycle generation.
    double_next: AtomicU64,
    /// Opaque payload. Free links chain their bundle through this field.
    payload: AtomicPtr<()>,
}

// === impl Link ===

impl Link {
    #[inline]
    pub fn single_next(&self) -> LinkRef {
        LinkRef::from_bits(self.single_next.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_single_next(&self, next: LinkRef) {
        self.single_next.store(next.raw(), Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn compare_exchange_single_next(
        &self,
        current: LinkRef,
        new: LinkRef,
    ) -> Result<(), LinkRef> {
        self.single_next
            .compare_exchange(
                current.raw(),
                new.raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(LinkRef::from_bits)
    }

    #[inline]
    pub fn payload(&self) -> *mut () {
        self.payload.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_payload(&self, payload: *mut ()) {
        self.payload.store(payload, Ordering::Release);
    }

    /// Loads the counter-carrying chain field.
    ///
    /// Unlike `single_next`, every mutation of this field advances its
    /// counter bits, including the clear performed by [`free_link`]. A
    /// compare-exchange against a snapshot of this field therefore fails if
    /// the link was recycled in between, which is what makes it safe to
    /// chain FIFO queues through links that a concurrent dequeue may free.
    #[inline]
    pub(crate) fn double_next(&self) -> LinkRef {
        LinkRef::from_bits(self.double_next.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn compare_exchange_double_next(
        &self,
        current: LinkRef,
        new: LinkRef,
    ) -> Result<(), LinkRef> {
        self.double_next
            .compare_exchange_weak(
                current.raw(),
                new.raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(LinkRef::from_bits)
    }

    /// The slot's current recycle generation.
    #[inline]
    pub(crate) fn generation(&self) -> u64 {
        LinkRef::from_bits(self.double_next.load(Ordering::Acquire)).counter()
    }

    /// Advances the recycle generation, returning the new value.
    ///
    /// Wrapping after 2^38 recycles is handled by
    /// [`tag_counter_overflowed`](crate::tag_counter_overflowed).
    fn bump_generation(&self) -> u64 {
        let next = self.generation().wrapping_add(1) % LinkRef::COUNTER_PERIOD;
        if next == 0 {
            crate::tag_counter_overflowed();
        }
        self.double_next
            .store(LinkRef::new_indexed(0, next).raw(), Ordering::Release);
        next
    }
}

/// The global pool: a table of lazily-allocated blocks of cache-line-padded
/// links. Indices are handed out monotonically and never reused at this
/// level; recycling happens through the bundle cache above.
struct LinkPool {
    blocks: [AtomicPtr<CachePadded<Link>>; MAX_BLOCKS],
    /// Next never-allocated index. Starts at 1, index 0 is the null link.
    next_index: AtomicU32,
}

// === impl LinkPool ===

impl LinkPool {
    const fn new() -> Self {
        Self {
            blocks: [const { AtomicPtr::new(ptr::null_mut()) }; MAX_BLOCKS],
            next_index: AtomicU32::new(1),
        }
    }

    /// Reserves a contiguous run of `count` fresh indices.
    fn allocate(&self, count: u32) -> u32 {
        let first = self.next_index.fetch_add(count, Ordering::Relaxed);
        let end = first.checked_add(count).unwrap_or(u32::MAX);
        if end > MAX_LINKS {
            crate::links_exhausted(MAX_LINKS);
        }
        for block in (first / LINKS_PER_BLOCK)..=((end - 1) / LINKS_PER_BLOCK) {
            self.ensure_block(block as usize);
        }
        first
    }

    fn ensure_block(&self, block: usize) {
        if !self.blocks[block].load(Ordering::Acquire).is_null() {
            return;
        }

        let layout = Self::block_layout();
        // Safety: the layout is non-zero-sized; zeroed memory is a valid
        // `Link` (atomics at zero, null payload).
        let fresh = unsafe { std::alloc::alloc_zeroed(layout) }.cast::<CachePadded<Link>>();
        assert!(!fresh.is_null(), "link pool block allocation failed");

        if self
            .blocks[block]
            .compare_exchange(
                ptr::null_mut(),
                fresh,
                Ordering::SeqCst,
                Ordering::Acquire,
            )
            .is_err()
        {
            // Another thread installed the block first; ours was never visible.
            // Safety: `fresh` came from `alloc_zeroed` with this exact layout.
            unsafe { std::alloc::dealloc(fresh.cast(), layout) };
        }
    }

    fn block_layout() -> std::alloc::Layout {
        std::alloc::Layout::array::<CachePadded<Link>>(LINKS_PER_BLOCK as usize)
            .expect("link block layout")
    }

    #[inline]
    fn deref_index(&self, index: u32) -> &Link {
        debug_assert!(index != 0, "dereferenced the null link");
        let block = (index / LINKS_PER_BLOCK) as usize;
        let offset = (index % LINKS_PER_BLOCK) as usize;
        let base = self.blocks[block].load(Ordering::Acquire);
        debug_assert!(!base.is_null(), "dereferenced an unallocated link block");
        // Safety: blocks are installed with a SeqCst compare-exchange before
        // any index into them is published, are never deallocated, and
        // `offset` is in bounds by construction.
        unsafe { &**base.add(offset) }
    }
}

static POOL: LinkPool = LinkPool::new();

/// Free bundles of [`LINKS_PER_BUNDLE`] links, shared between threads.
static GLOBAL_FREE_BUNDLES: LifoRoot = LifoRoot::new();

/// Per-thread cache of links: one partial bundle popped from, one full bundle
/// in reserve. Deliberately never reclaimed on thread exit; tearing the cache
/// down while other threads may still traverse freed links is not worth a
/// bounded leak per thread.
#[derive(Clone, Copy)]
struct ThreadCache {
    /// `LinkRef` bits of the head of the bundle currently popped from.
    partial: u64,
    /// `LinkRef` bits of a full bundle held in reserve.
    full: u64,
    num_partial: u32,
}

thread_local! {
    static CACHE: Cell<ThreadCache> = const {
        Cell::new(ThreadCache { partial: 0, full: 0, num_partial: 0 })
    };
}

/// Resolves a `LinkRef` to its pool entry, ignoring the counter bits.
///
/// The returned reference is valid forever: pool memory is never returned to
/// the OS. Reading a link that has since been recycled is well-defined; any
/// compare-exchange based on its stale `LinkRef` will fail.
#[must_use]
pub fn deref_link(link: LinkRef) -> &'static Link {
    POOL.deref_index(link.index())
}

/// The pool's high-water mark in links.
#[must_use]
pub fn allocated_links() -> u32 {
    POOL.next_index.load(Ordering::Relaxed).saturating_sub(1)
}

/// Allocates one link from the calling thread's bundle cache.
///
/// The returned link has a clear payload and chain fields, and its `LinkRef`
/// carries the slot's current generation.
#[must_use]
pub fn alloc_link() -> LinkRef {
    CACHE.with(|cell| {
        let mut tls = cell.get();

        if tls.partial == 0 {
            if tls.full != 0 {
                tls.partial = tls.full;
                tls.full = 0;
            } else if let Some(bundle) = GLOBAL_FREE_BUNDLES.pop() {
                tls.partial = bundle.raw();
            } else {
                tls.partial = fresh_bundle().raw();
            }
            tls.num_partial = LINKS_PER_BUNDLE;
        }

        let result = LinkRef::from_bits(tls.partial);
        let link = deref_link(result);
        tls.partial = link.payload() as u64;
        tls.num_partial -= 1;
        cell.set(tls);

        link.payload.store(ptr::null_mut(), Ordering::Relaxed);
        debug_assert!(link.single_next().is_null());
        debug_assert_eq!(result.counter(), link.generation());
        result
    })
}

/// Returns one link to the calling thread's bundle cache.
///
/// Clears the entry and advances the slot's generation, invalidating every
/// `LinkRef` previously handed out for this slot.
pub fn free_link(link: LinkRef) {
    CACHE.with(|cell| {
        let mut tls = cell.get();

        if tls.num_partial >= LINKS_PER_BUNDLE {
            if tls.full != 0 {
                GLOBAL_FREE_BUNDLES.push(LinkRef::from_bits(tls.full));
            }
            tls.full = tls.partial;
            tls.partial = 0;
            tls.num_partial = 0;
        }

        let entry = deref_link(link);
        let generation = entry.bump_generation();
        entry.single_next.store(0, Ordering::Relaxed);
        entry.payload.store(tls.partial as usize as *mut (), Ordering::Relaxed);

        tls.partial = LinkRef::new_indexed(link.index(), generation).raw();
        tls.num_partial += 1;
        cell.set(tls);
    });
}

/// Chains a fresh bundle of links straight from the pool.
fn fresh_bundle() -> LinkRef {
    let first = POOL.allocate(LINKS_PER_BUNDLE);
    let mut head = 0u64;
    for index in first..first + LINKS_PER_BUNDLE {
        let link = POOL.deref_index(index);
        link.payload.store(head as usize as *mut (), Ordering::Relaxed);
        head = LinkRef::new_indexed(index, link.generation()).raw();
    }
    LinkRef::from_bits(head)
}
