// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::scheduler::{QueuePreference, Scheduler, SchedulerInner, global_scheduler};
use crate::slots::ConcurrencySlots;
use crate::task::{Priority, Task, TaskRef};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};
use emtime::TimeSpan;
use links::FifoList;
use std::sync::{Arc, OnceLock};
use sync::{EventMode, EventRef, acquire_event};
use util::non_null;

/// Limits how many of the tasks pushed into it run at the same time.
///
/// Useful when many tasks contend on a shared resource: each invocation
/// receives a slot index in `[0..max_concurrency)`, unique among the tasks
/// executing at that moment, which can index per-slot buffers without any
/// further synchronization.
///
/// The limiter may be dropped while tasks are still queued; every pushed
/// task keeps the internal state alive until it has finished, so the work
/// still drains. Use [`wait`](Self::wait) first when completion must be
/// observed.
///
/// ```ignore
/// let limiter = ConcurrencyLimiter::new(4);
/// for chunk in chunks {
///     limiter.push("accumulate", move |slot| accumulators[slot as usize].add(chunk));
/// }
/// limiter.wait(TimeSpan::INFINITE);
/// ```
pub struct ConcurrencyLimiter {
    inner: Arc<LimiterInner>,
}

struct LimiterInner {
    slots: ConcurrencySlots,
    priority: Priority,
    /// Pending task descriptors in push order.
    work_queue: FifoList<Task>,
    num_work_items: AtomicU64,
    /// Lazily allocated by the first `wait`; triggered whenever the counter
    /// reaches zero and never reset afterwards.
    completion: OnceLock<EventRef>,
    scheduler: Arc<SchedulerInner>,
}

// === impl ConcurrencyLimiter ===

impl ConcurrencyLimiter {
    /// A limiter of width `max_concurrency` on the process-wide scheduler.
    #[must_use]
    pub fn new(max_concurrency: u32) -> Self {
        Self::with_scheduler(global_scheduler(), max_concurrency, Priority::Default)
    }

    /// A limiter of width `max_concurrency` launching at `priority` on
    /// `scheduler`.
    #[must_use]
    pub fn with_scheduler(scheduler: &Scheduler, max_concurrency: u32, priority: Priority) -> Self {
        Self {
            inner: Arc::new(LimiterInner {
                slots: ConcurrencySlots::new(max_concurrency),
                priority,
                work_queue: FifoList::new(),
                num_work_items: AtomicU64::new(0),
                completion: OnceLock::new(),
                scheduler: Arc::clone(scheduler.inner()),
            }),
        }
    }

    /// Pushes a new task.
    ///
    /// `f` runs on the scheduler once a slot is free and receives the slot
    /// index it holds for the duration of the call.
    pub fn push(&self, name: &'static str, f: impl FnOnce(u32) + Send + 'static) {
        let inner = Arc::clone(&self.inner);
        let task = Task::new_deferred(name, self.inner.priority);

        // The slot is not known yet; it is bound through the task's user
        // data at launch time. The captured handles keep both the task and
        // the limiter state alive until execution consumes the closure.
        let captured = Arc::clone(&task);
        task.set_callable(move || {
            let slot = u32::try_from(captured.user_data() as usize).expect("slot fits u32");
            f(slot);
            inner.complete_work_item(slot);
        });

        self.inner.add_work_item(task);
    }

    /// Waits for all pushed tasks to complete.
    ///
    /// Returns true once the outstanding counter has reached zero, false on
    /// timeout. A satisfied wait stays satisfied even if more tasks are
    /// pushed afterwards.
    pub fn wait(&self, timeout: TimeSpan) -> bool {
        if self.inner.num_work_items.load(Ordering::SeqCst) == 0 {
            return true;
        }

        let event = self
            .inner
            .completion
            .get_or_init(|| acquire_event(EventMode::ManualReset));

        // Re-check: the last task may have finished before the event
        // existed, in which case nobody will ever trigger it.
        if self.inner.num_work_items.load(Ordering::SeqCst) == 0 {
            return true;
        }

        event.wait_for(timeout)
    }
}

// === impl LimiterInner ===

impl LimiterInner {
    fn add_work_item(&self, task: TaskRef) {
        self.num_work_items.fetch_add(1, Ordering::SeqCst);
        self.work_queue.push(into_raw(task));

        if let Some(slot) = self.slots.alloc() {
            // Pushed from the outside: wake a worker for the new work.
            self.process_queue(slot, false);
        }
    }

    /// Runs after a task body: retire the work item, then feed the next
    /// pending task onto the slot just vacated.
    fn complete_work_item(&self, slot: u32) {
        if self.num_work_items.fetch_sub(1, Ordering::SeqCst) == 1 {
            if let Some(event) = self.completion.get() {
                event.trigger();
            }
        }

        // Already on a worker: prefer the local queue and skip the first
        // wake-up so this worker picks the next item up itself.
        self.process_queue(slot, true);
    }

    fn process_queue(&self, mut slot: u32, from_worker: bool) {
        let mut wake_worker = !from_worker;
        loop {
            if let Some(raw) = self.work_queue.pop() {
                let task = from_raw(raw);
                task.set_user_data(slot as usize as *mut ());

                let preference = if wake_worker {
                    QueuePreference::Global
                } else {
                    QueuePreference::Local
                };
                let launched = self.scheduler.try_launch(&task, preference, wake_worker);
                debug_assert!(launched, "limiter tasks launch exactly once");
            } else {
                self.slots.release(slot);
                return;
            }

            // Additional launches always wake.
            wake_worker = true;

            match self.slots.alloc() {
                Some(next) => slot = next,
                None => return,
            }
        }
    }
}

fn into_raw(task: TaskRef) -> NonNull<Task> {
    // Safety: Arc::into_raw never returns null.
    unsafe { non_null(Arc::into_raw(task).cast_mut()) }
}

fn from_raw(raw: NonNull<Task>) -> TaskRef {
    // Safety: the pointer came from `into_raw` and is consumed exactly once.
    unsafe { Arc::from_raw(raw.as_ptr().cast_const()) }
}
