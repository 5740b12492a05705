// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::GuardNoSend;
use crate::backoff::Backoff;
use crate::park;
use core::cell::Cell;
use core::fmt;
use core::marker::PhantomData;
use core::num::NonZeroUsize;
use core::ops::Deref;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Spin budget to burn before falling back to the parking lot. Matches the
/// tuning of the platform critical sections this lock replaces.
const SPIN_LIMIT: u32 = 4000;

/// A mutex which can be recursively locked by a single thread.
///
/// This type differs from [`Mutex`](crate::Mutex) in two ways:
///
/// - Locking multiple times from the same thread works instead of
///   deadlocking.
/// - Contended locks spin for a bounded number of iterations and then park,
///   so holding it across a longer operation does not burn a core on every
///   waiter.
///
/// `ReentrantMutexGuard` does not give mutable references to the locked
/// data; use a `RefCell` if you need them.
pub struct ReentrantMutex<T: ?Sized> {
    owner: AtomicUsize,
    lock_count: Cell<usize>,
    lock: AtomicBool,
    data: core::cell::UnsafeCell<T>,
}

/// An RAII guard for [`ReentrantMutex`]; unlocks once when dropped.
#[clippy::has_significant_drop]
#[must_use = "if unused the ReentrantMutex will immediately unlock"]
pub struct ReentrantMutexGuard<'a, T: ?Sized> {
    remutex: &'a ReentrantMutex<T>,
    marker: PhantomData<(&'a T, GuardNoSend)>,
}

// Safety: the lock serializes access; reentrancy is per-thread.
unsafe impl<T: ?Sized + Send> Send for ReentrantMutex<T> {}
// Safety: as above.
unsafe impl<T: ?Sized + Send> Sync for ReentrantMutex<T> {}

// === impl ReentrantMutex ===

impl<T> ReentrantMutex<T> {
    /// Creates a new reentrant mutex in an unlocked state ready for use.
    #[inline]
    pub const fn new(val: T) -> ReentrantMutex<T> {
        ReentrantMutex {
            owner: AtomicUsize::new(0),
            lock_count: Cell::new(0),
            lock: AtomicBool::new(false),
            data: core::cell::UnsafeCell::new(val),
        }
    }

    /// Consumes this mutex, returning the underlying data.
    #[inline]
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> ReentrantMutex<T> {
    /// Creates a guard without checking if the lock is held.
    ///
    /// # Safety
    ///
    /// This method must only be called if the thread logically holds the
    /// lock.
    #[inline]
    pub unsafe fn make_guard_unchecked(&self) -> ReentrantMutexGuard<'_, T> {
        ReentrantMutexGuard {
            remutex: self,
            marker: PhantomData,
        }
    }

    #[inline]
    fn lock_internal<F: FnOnce() -> bool>(&self, lock_inner: F) -> bool {
        let id = nonzero_thread_id().get();

        if self.owner.load(Ordering::Relaxed) == id {
            self.lock_count.set(
                self.lock_count
                    .get()
                    .checked_add(1)
                    .expect("ReentrantMutex lock count overflow"),
            );
        } else {
            if !lock_inner() {
                return false;
            }
            self.owner.store(id, Ordering::Relaxed);
            debug_assert_eq!(self.lock_count.get(), 0);
            self.lock_count.set(1);
        }
        true
    }

    /// Acquires the mutex, blocking the current thread until it is able to
    /// do so.
    ///
    /// A thread that already holds the lock increments the count and returns
    /// immediately. Contended acquisition spins through a [`SPIN_LIMIT`]
    /// budget, then parks on the lock's address until an unlock wakes it.
    #[inline]
    pub fn lock(&self) -> ReentrantMutexGuard<'_, T> {
        let locked = self.lock_internal(|| {
            self.lock_slow();
            true
        });
        debug_assert!(locked);

        // Safety: we have just ensured the mutex is locked by this thread
        unsafe { self.make_guard_unchecked() }
    }

    fn lock_slow(&self) {
        let mut boff = Backoff::with_spin_budget(SPIN_LIMIT);

        while self
            .lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.is_locked() {
                if !boff.spin() {
                    park::wait(self.address(), || self.is_locked(), || {});
                }
            }
        }
    }

    /// Attempts to acquire this lock without blocking.
    #[inline]
    pub fn try_lock(&self) -> Option<ReentrantMutexGuard<'_, T>> {
        let locked = self.lock_internal(|| {
            self.lock
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
        });

        if locked {
            // Safety: we have just ensured the mutex is locked by this thread
            unsafe { Some(self.make_guard_unchecked()) }
        } else {
            None
        }
    }

    /// Returns a mutable reference to the underlying data.
    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        // Safety: the exclusive borrow means no guard can exist.
        unsafe { &mut *self.data.get() }
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.lock.load(Ordering::Relaxed)
    }

    /// Checks whether the mutex is currently held by the current thread.
    #[inline]
    pub fn is_owned_by_current_thread(&self) -> bool {
        self.owner.load(Ordering::Relaxed) == nonzero_thread_id().get()
    }

    /// Forcibly unlocks the mutex once.
    ///
    /// # Safety
    ///
    /// This method must only be called if the current thread logically owns
    /// a guard that has been discarded with `mem::forget`.
    #[inline]
    pub unsafe fn force_unlock(&self) {
        let lock_count = self.lock_count.get() - 1;
        self.lock_count.set(lock_count);
        if lock_count == 0 {
            self.owner.store(0, Ordering::Relaxed);
            self.lock.store(false, Ordering::Release);
            park::wake_one(self.address());
        }
    }

    fn address(&self) -> *const () {
        core::ptr::from_ref(&self.lock).cast()
    }
}

impl<T: Default> Default for ReentrantMutex<T> {
    #[inline]
    fn default() -> ReentrantMutex<T> {
        ReentrantMutex::new(T::default())
    }
}

impl<T> From<T> for ReentrantMutex<T> {
    #[inline]
    fn from(t: T) -> ReentrantMutex<T> {
        ReentrantMutex::new(t)
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for ReentrantMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_lock() {
            Some(guard) => f
                .debug_struct("ReentrantMutex")
                .field("data", &&*guard)
                .finish(),
            None => f
                .debug_struct("ReentrantMutex")
                .field("data", &"<locked>")
                .finish(),
        }
    }
}

// === impl ReentrantMutexGuard ===

// Safety: the guard only hands out &T.
unsafe impl<'a, T: ?Sized + Sync + 'a> Sync for ReentrantMutexGuard<'a, T> {}

impl<'a, T: ?Sized + 'a> Deref for ReentrantMutexGuard<'a, T> {
    type Target = T;
    #[inline]
    fn deref(&self) -> &T {
        // Safety: the guard holds the lock.
        unsafe { &*self.remutex.data.get() }
    }
}

impl<'a, T: ?Sized + 'a> Drop for ReentrantMutexGuard<'a, T> {
    #[inline]
    fn drop(&mut self) {
        // Safety: a guard always holds the lock.
        unsafe {
            self.remutex.force_unlock();
        }
    }
}

impl<'a, T: fmt::Debug + ?Sized + 'a> fmt::Debug for ReentrantMutexGuard<'a, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

fn nonzero_thread_id() -> NonZeroUsize {
    thread_local! {
        static ID: u8 = const { 0 };
    }
    ID.with(|id| NonZeroUsize::new(core::ptr::from_ref(id) as usize))
        .expect("thread ID was zero")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn reentrant_locking_works() {
        let mutex = ReentrantMutex::new(Cell::new(0));
        let a = mutex.lock();
        let b = mutex.lock();
        b.set(b.get() + 1);
        drop(b);
        a.set(a.get() + 1);
        drop(a);
        assert_eq!(mutex.lock().get(), 2);
    }

    #[test]
    fn try_lock_fails_cross_thread_only() {
        let mutex = Arc::new(ReentrantMutex::new(()));
        let guard = mutex.lock();
        assert!(mutex.try_lock().is_some(), "same thread may re-lock");
        assert!(mutex.is_owned_by_current_thread());

        let other = {
            let mutex = Arc::clone(&mutex);
            std::thread::spawn(move || mutex.try_lock().is_some())
        };
        assert!(!other.join().unwrap(), "other thread must fail");
        drop(guard);
    }

    #[test]
    fn unlock_wakes_parked_waiter() {
        let mutex = Arc::new(ReentrantMutex::new(Cell::new(0)));
        let guard = mutex.lock();

        let waiter = {
            let mutex = Arc::clone(&mutex);
            std::thread::spawn(move || {
                let guard = mutex.lock();
                guard.set(guard.get() + 1);
            })
        };

        // Give the waiter long enough to exhaust its spin budget and park.
        std::thread::sleep(std::time::Duration::from_millis(20));
        drop(guard);
        waiter.join().unwrap();
        assert_eq!(mutex.lock().get(), 1);
    }

    #[test]
    fn contended_increments() {
        let mutex = Arc::new(ReentrantMutex::new(Cell::new(0)));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let mutex = Arc::clone(&mutex);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let guard = mutex.lock();
                        guard.set(guard.get() + 1);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(mutex.lock().get(), 4000);
    }
}
