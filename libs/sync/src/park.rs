// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Address-keyed wait queues.
//!
//! Any address can serve as a synchronization rendezvous: a global sharded
//! table maps addresses to per-bucket FIFOs of waiting threads, so a wait
//! primitive costs one atomic word at the use site instead of a kernel
//! object per instance.
//!
//! The contract that makes lost wakeups impossible: `can_wait` runs while
//! the bucket is locked, and a waker for the same address takes that same
//! lock before it scans the queue. A waiter that observes its condition
//! under the lock is therefore guaranteed to be visible to any later wake
//! for that address.
//!
//! Waiters within a bucket are woken in enqueue order. Spurious kernel
//! wakeups are absorbed internally and never surface to callers.

use crate::mutex::Mutex;
use core::sync::atomic::{AtomicUsize, Ordering};
use emtime::{TimePoint, TimeSpan};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex as StdMutex, OnceLock};

/// What happened during a [`wait`] call.
#[derive(Debug, Clone, Copy, Default)]
pub struct WaitState {
    /// True only if `can_wait` returned true and the thread was enqueued.
    pub did_wait: bool,
    /// True only if a wake call ended the wait; false for timeouts.
    pub did_wake: bool,
    /// Value returned by the waker's `on_wake` callback, zero otherwise.
    pub wake_token: u64,
}

/// State passed to a waker's `on_wake` callback, under the bucket lock.
#[derive(Debug, Clone, Copy, Default)]
pub struct WakeState {
    /// Did a thread wake up?
    pub did_wake: bool,
    /// Does the queue have more threads waiting on this address?
    pub has_more: bool,
}

/// One per thread, lazily created, reused across waits.
struct WaitNode {
    state: StdMutex<NodeState>,
    condvar: Condvar,
}

#[derive(Default)]
struct NodeState {
    signaled: bool,
    token: u64,
}

struct Waiter {
    address: usize,
    node: Arc<WaitNode>,
}

#[derive(Default)]
struct Bucket {
    queue: Mutex<VecDeque<Waiter>>,
}

static BUCKET_HINT: AtomicUsize = AtomicUsize::new(0);
static TABLE: OnceLock<Box<[Bucket]>> = OnceLock::new();

/// Sizes the bucket table for the expected number of threads.
///
/// Only effective before the first wait or wake; the table is built once and
/// never rehashed.
pub fn reserve(thread_count: usize) {
    BUCKET_HINT.store(thread_count, Ordering::Relaxed);
}

fn table() -> &'static [Bucket] {
    TABLE.get_or_init(|| {
        let hint = BUCKET_HINT.load(Ordering::Relaxed);
        let buckets = (hint * 4).next_power_of_two().max(64);
        tracing::debug!(target: "park", buckets, "parking lot initialized");
        (0..buckets).map(|_| Bucket::default()).collect()
    })
}

fn bucket_for(address: usize) -> &'static Bucket {
    let table = table();
    // Fibonacci hashing; the table length is a power of two.
    let hash = address.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    &table[hash >> (usize::BITS as usize - table.len().trailing_zeros() as usize)]
}

thread_local! {
    static NODE: Arc<WaitNode> = Arc::new(WaitNode {
        state: StdMutex::new(NodeState::default()),
        condvar: Condvar::new(),
    });
}

/// Queues the calling thread to wait if `can_wait` returns true.
///
/// `can_wait` runs while the bucket is locked; returning false cancels the
/// wait. `before_wait` runs after the thread is enqueued and the bucket
/// unlocked, but before the thread actually blocks.
pub fn wait(
    address: *const (),
    can_wait: impl FnOnce() -> bool,
    before_wait: impl FnOnce(),
) -> WaitState {
    wait_inner(address as usize, can_wait, before_wait, None)
}

/// Like [`wait`], giving up after `timeout` has elapsed.
///
/// Non-positive timeouts degenerate to a locked `can_wait` check without
/// ever blocking.
pub fn wait_for(
    address: *const (),
    can_wait: impl FnOnce() -> bool,
    before_wait: impl FnOnce(),
    timeout: TimeSpan,
) -> WaitState {
    if timeout.is_infinite() {
        return wait_inner(address as usize, can_wait, before_wait, None);
    }
    wait_until(address, can_wait, before_wait, TimePoint::now() + timeout)
}

/// Like [`wait`], giving up once the monotonic clock passes `deadline`.
pub fn wait_until(
    address: *const (),
    can_wait: impl FnOnce() -> bool,
    before_wait: impl FnOnce(),
    deadline: TimePoint,
) -> WaitState {
    if deadline.is_infinite() {
        return wait_inner(address as usize, can_wait, before_wait, None);
    }
    if deadline <= TimePoint::now() {
        // Poll: evaluate the predicate under the lock, never block. A
        // predicate that would have waited reports as an immediate timeout,
        // so callers distinguish "condition already met" from "out of time".
        let bucket = bucket_for(address as usize);
        let queue = bucket.queue.lock();
        let would_wait = can_wait();
        drop(queue);
        return WaitState {
            did_wait: would_wait,
            did_wake: false,
            wake_token: 0,
        };
    }
    wait_inner(address as usize, can_wait, before_wait, Some(deadline))
}

fn wait_inner(
    address: usize,
    can_wait: impl FnOnce() -> bool,
    before_wait: impl FnOnce(),
    deadline: Option<TimePoint>,
) -> WaitState {
    let bucket = bucket_for(address);
    let node = NODE.with(Arc::clone);

    {
        let mut queue = bucket.queue.lock();
        if !can_wait() {
            return WaitState::default();
        }
        *node.state.lock().expect("wait node poisoned") = NodeState::default();
        queue.push_back(Waiter {
            address,
            node: Arc::clone(&node),
        });
    }

    before_wait();

    let mut state = node.state.lock().expect("wait node poisoned");
    loop {
        if state.signaled {
            return WaitState {
                did_wait: true,
                did_wake: true,
                wake_token: state.token,
            };
        }

        match deadline {
            None => {
                state = node.condvar.wait(state).expect("wait node poisoned");
            }
            Some(deadline) => {
                let now = TimePoint::now();
                if now >= deadline {
                    break;
                }
                let timeout = (deadline - now)
                    .as_duration()
                    .expect("finite deadline");
                (state, _) = node
                    .condvar
                    .wait_timeout(state, timeout)
                    .expect("wait node poisoned");
            }
        }
    }
    drop(state);

    // Timed out. Remove ourselves; if a waker already dequeued us, the wake
    // is in flight and must be consumed instead of reported as a timeout.
    let removed = {
        let mut queue = bucket.queue.lock();
        queue
            .iter()
            .position(|waiter| Arc::ptr_eq(&waiter.node, &node))
            .and_then(|position| queue.remove(position))
            .is_some()
    };

    if removed {
        return WaitState {
            did_wait: true,
            did_wake: false,
            wake_token: 0,
        };
    }

    let mut state = node.state.lock().expect("wait node poisoned");
    while !state.signaled {
        state = node.condvar.wait(state).expect("wait node poisoned");
    }
    WaitState {
        did_wait: true,
        did_wake: true,
        wake_token: state.token,
    }
}

/// Wakes the first thread waiting on `address`.
///
/// `on_wake` runs while the bucket is locked and its return value becomes
/// the woken thread's `wake_token`.
pub fn wake_one_with(address: *const (), on_wake: impl FnOnce(WakeState) -> u64) -> WakeState {
    let bucket = bucket_for(address as usize);

    let (wake_state, woken, token) = {
        let mut queue = bucket.queue.lock();
        let woken = queue
            .iter()
            .position(|waiter| waiter.address == address as usize)
            .and_then(|position| queue.remove(position))
            .map(|waiter| waiter.node);
        let wake_state = WakeState {
            did_wake: woken.is_some(),
            has_more: queue.iter().any(|waiter| waiter.address == address as usize),
        };
        let token = on_wake(wake_state);
        (wake_state, woken, token)
    };

    if let Some(node) = woken {
        signal(&node, token);
    }
    wake_state
}

/// Wakes the first thread waiting on `address`.
pub fn wake_one(address: *const ()) -> WakeState {
    wake_one_with(address, |_| 0)
}

/// Wakes up to `count` threads waiting on `address`, in enqueue order.
/// Returns how many were woken.
pub fn wake_multiple(address: *const (), count: usize) -> usize {
    let bucket = bucket_for(address as usize);

    let woken: Vec<_> = {
        let mut queue = bucket.queue.lock();
        let mut woken = Vec::new();
        let mut index = 0;
        while woken.len() < count && index < queue.len() {
            if queue[index].address == address as usize {
                woken.push(queue.remove(index).expect("index in bounds").node);
            } else {
                index += 1;
            }
        }
        woken
    };

    let count = woken.len();
    for node in woken {
        signal(&node, 0);
    }
    count
}

/// Wakes every thread waiting on `address`, returning how many there were.
pub fn wake_all(address: *const ()) -> usize {
    wake_multiple(address, usize::MAX)
}

fn signal(node: &WaitNode, token: u64) {
    let mut state = node.state.lock().expect("wait node poisoned");
    state.signaled = true;
    state.token = token;
    node.condvar.notify_one();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    fn addr_of(flag: &AtomicBool) -> *const () {
        core::ptr::from_ref(flag).cast()
    }

    #[test]
    fn predicate_false_cancels_the_wait() {
        let flag = AtomicBool::new(false);
        let state = wait(addr_of(&flag), || false, || panic!("never enqueued"));
        assert!(!state.did_wait);
        assert!(!state.did_wake);
    }

    #[test]
    fn timeout_reports_no_wake() {
        let flag = AtomicBool::new(false);
        let state = wait_for(
            addr_of(&flag),
            || true,
            || {},
            TimeSpan::from_millis(20.0),
        );
        assert!(state.did_wait);
        assert!(!state.did_wake);
    }

    #[test]
    fn zero_timeout_never_blocks() {
        let flag = AtomicBool::new(false);
        let start = TimePoint::now();

        let state = wait_for(addr_of(&flag), || true, || {}, TimeSpan::ZERO);
        assert!(state.did_wait, "reported as an immediate timeout");
        assert!(!state.did_wake);
        assert!((TimePoint::now() - start).to_seconds() < 1.0);

        // A predicate that declines reports a canceled wait instead.
        let state = wait_for(addr_of(&flag), || false, || {}, TimeSpan::ZERO);
        assert!(!state.did_wait);
    }

    #[test]
    fn wake_one_delivers_the_token() {
        static FLAG: AtomicBool = AtomicBool::new(false);

        let waiter = std::thread::spawn(|| {
            wait(
                addr_of(&FLAG),
                || !FLAG.load(Ordering::Acquire),
                || {},
            )
        });

        // Wake repeatedly until the waiter was actually enqueued.
        FLAG.store(true, Ordering::Release);
        loop {
            let state = wake_one_with(addr_of(&FLAG), |_| 77);
            if state.did_wake {
                break;
            }
            std::thread::yield_now();
        }

        let state = waiter.join().unwrap();
        assert!(state.did_wait);
        assert!(state.did_wake);
        assert_eq!(state.wake_token, 77);
    }

    #[test]
    fn wake_without_waiters_reports_none() {
        let flag = AtomicBool::new(false);
        let state = wake_one(addr_of(&flag));
        assert!(!state.did_wake);
        assert!(!state.has_more);
        assert_eq!(wake_all(addr_of(&flag)), 0);
    }

    // Five staggered waiters, woken one at a time: strict FIFO order.
    #[test]
    fn waiters_wake_in_enqueue_order() {
        use std::sync::atomic::AtomicUsize;

        static GATE: AtomicBool = AtomicBool::new(false);
        static WAITING: AtomicUsize = AtomicUsize::new(0);
        static WOKEN: AtomicUsize = AtomicUsize::new(0);

        let handles: Vec<_> = (0..5usize)
            .map(|rank| {
                std::thread::spawn(move || {
                    // Serialize enqueue order by rank.
                    while WAITING.load(Ordering::Acquire) != rank {
                        std::thread::yield_now();
                    }
                    let state = wait(
                        addr_of(&GATE),
                        || !GATE.load(Ordering::Acquire),
                        || {
                            WAITING.store(rank + 1, Ordering::Release);
                        },
                    );
                    assert!(state.did_wake);
                    WOKEN.fetch_add(1, Ordering::AcqRel)
                })
            })
            .collect();

        while WAITING.load(Ordering::Acquire) != 5 {
            std::thread::yield_now();
        }

        for expected in 0..5usize {
            loop {
                let state = wake_one(addr_of(&GATE));
                if state.did_wake {
                    assert_eq!(state.has_more, expected != 4);
                    break;
                }
                std::thread::yield_now();
            }
            // The woken thread observes its wake rank; FIFO means thread
            // `expected` is the one released now.
            while WOKEN.load(Ordering::Acquire) != expected + 1 {
                std::thread::yield_now();
            }
        }

        let ranks: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(ranks, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn timeout_racing_wake_is_not_lost() {
        static FLAG: AtomicBool = AtomicBool::new(false);

        for _ in 0..50 {
            let waiter = std::thread::spawn(|| {
                wait_for(
                    addr_of(&FLAG),
                    || true,
                    || {},
                    TimeSpan::from_millis(1.0),
                )
            });
            std::thread::sleep(Duration::from_millis(1));
            let wake = wake_one(addr_of(&FLAG));
            let state = waiter.join().unwrap();

            // Either the wake found nobody (clean timeout) or the waiter saw
            // the wake; a wake that claimed a waiter must be observed.
            if wake.did_wake {
                assert!(state.did_wake);
            }
        }
    }
}
