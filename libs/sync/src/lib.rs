// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Synchronization primitives for the engine core.
//!
//! The layering goes: [`park`] provides address-keyed wait queues (any
//! address can serve as a rendezvous without a per-address allocation), and
//! everything that blocks ([`Event`], [`EventCount`], [`Semaphore`], the
//! slow path of [`ReentrantMutex`]) is built on top of it. [`Mutex`] is a
//! plain spin lock for the short critical sections inside the other
//! primitives.

mod backoff;
mod event;
mod event_count;
mod event_pool;
mod loom;
mod mutex;
pub mod park;
mod remutex;
mod semaphore;

pub use backoff::Backoff;
pub use event::{Event, EventMode};
pub use event_count::{EventCount, WaitToken};
pub use event_pool::{EventRef, SharedEventRef, acquire_event};
pub use mutex::{Mutex, MutexGuard};
pub use remutex::{ReentrantMutex, ReentrantMutexGuard};
pub use semaphore::Semaphore;

/// A marker type which makes guards `!Send`.
#[allow(dead_code, reason = "only used as a phantom marker")]
pub(crate) struct GuardNoSend(*mut ());
