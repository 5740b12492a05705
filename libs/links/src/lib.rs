// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The indexed link pool: the reclamation substrate shared by every lock-free
//! list in the engine.
//!
//! Lock-free lists built on raw pointers are vulnerable to the [ABA problem]:
//! a slot can be freed and reallocated between a thread's read and its
//! compare-exchange, leaving the compare-exchange to succeed against a
//! different tenant. The engine sidesteps this by never linking lists through
//! raw pointers. List heads and next-fields hold [`LinkRef`]s instead, a
//! 64-bit value packing a 26-bit index into a global pool of [`Link`] entries
//! together with a 38-bit counter that advances every time the slot is
//! recycled. A stale `LinkRef` can never compare equal to the current one, so
//! the stale compare-exchange fails exactly as it should.
//!
//! Pool memory is allocated in large blocks and never returned to the OS;
//! only individual links are recycled. This is what makes it safe to read a
//! link that a concurrent thread has already freed: the memory is still a
//! live `Link`, and the counter mismatch makes the subsequent
//! compare-exchange fail.
//!
//! Allocation goes through a per-thread cache of link bundles
//! ([`alloc_link`]/[`free_link`]), so the steady-state cost is one
//! compare-exchange per 64 allocations.
//!
//! [ABA problem]: https://en.wikipedia.org/wiki/ABA_problem

mod fifo;
mod lifo;
mod link_ref;
mod pool;

pub use fifo::FifoList;
pub use lifo::{LifoList, LifoRoot};
pub use link_ref::LinkRef;
pub use pool::{Link, alloc_link, allocated_links, deref_link, free_link};

/// Called when the link pool has consumed its entire index space.
///
/// This indicates a leak or an unbounded data structure, not a recoverable
/// condition: the process is aborted after logging the diagnostic.
pub(crate) fn links_exhausted(total: u32) -> ! {
    tracing::error!(
        target: "links",
        total,
        "consumed all lock-free links; there are no more"
    );
    std::process::abort();
}

/// Called when a slot's 38-bit recycle counter wraps.
///
/// Not expected to be a problem and not expected to happen often. Sleeping
/// briefly makes it vanishingly unlikely that a thread still holds a
/// `LinkRef` from 2^38 recycles ago.
pub(crate) fn tag_counter_overflowed() {
    tracing::info!(target: "links", "link recycle counter wrapped");
    std::thread::sleep(core::time::Duration::from_millis(1));
}
