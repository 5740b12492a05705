// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU8, Ordering};
use std::sync::Arc;
use sync::{EventCount, Mutex};

/// Scheduling priority of a task.
///
/// Workers drain the global queues in `High → Default → Background` order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    High,
    #[default]
    Default,
    Background,
}

impl Priority {
    pub const COUNT: usize = 3;

    #[must_use]
    pub(crate) fn index(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Default => 1,
            Priority::Background => 2,
        }
    }
}

/// Lifecycle state of a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// Initialized but not yet queued; the only state a launch accepts.
    Created = 0,
    /// Queued; may be retracted back to `Created` or claimed by an executor.
    Scheduled = 1,
    /// Claimed by an executor; the callable is running.
    Executing = 2,
    /// Finished; waiters have been notified.
    Completed = 3,
    /// Discarded without running (scheduler shutdown).
    Abandoned = 4,
}

impl TaskState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TaskState::Created,
            1 => TaskState::Scheduled,
            2 => TaskState::Executing,
            3 => TaskState::Completed,
            _ => TaskState::Abandoned,
        }
    }
}

/// Shared handle to a [`Task`].
///
/// The launching code owns the task through this handle; queues and workers
/// hold additional references only while the task is in flight.
pub type TaskRef = Arc<Task>;

type TaskFn = Box<dyn FnOnce() + Send>;

/// A low-level task: a named, prioritized callable with an atomic state
/// machine.
///
/// All transitions are one-way except `Scheduled → Created`, which
/// [`retract`](Self::retract) may perform exactly once per launch. Completion
/// notifies the task's event-count so [`wait_for_task`] callers and
/// subsequents become eligible.
///
/// [`wait_for_task`]: crate::wait_for_task
pub struct Task {
    name: &'static str,
    priority: Priority,
    state: AtomicU8,
    /// Opaque per-launch payload, e.g. the concurrency-limiter slot.
    user_data: AtomicPtr<()>,
    /// Consumed by execution; dropped unrun on abandon.
    callable: Mutex<Option<TaskFn>>,
    /// Notified on completion or abandonment.
    finished: EventCount,
}

// === impl Task ===

impl Task {
    /// Creates a task ready to launch.
    #[must_use]
    pub fn new(
        name: &'static str,
        priority: Priority,
        f: impl FnOnce() + Send + 'static,
    ) -> TaskRef {
        let task = Self::new_deferred(name, priority);
        task.set_callable(f);
        task
    }

    /// Creates a task whose callable is supplied later with
    /// [`set_callable`](Self::set_callable).
    ///
    /// Needed when the closure has to capture the task's own handle, such as
    /// the limiter reading its slot out of the user data.
    #[must_use]
    pub fn new_deferred(name: &'static str, priority: Priority) -> TaskRef {
        Arc::new(Self {
            name,
            priority,
            state: AtomicU8::new(TaskState::Created as u8),
            user_data: AtomicPtr::new(ptr::null_mut()),
            callable: Mutex::new(None),
            finished: EventCount::new(),
        })
    }

    /// Installs the callable. Must happen before the first launch.
    pub fn set_callable(&self, f: impl FnOnce() + Send + 'static) {
        let previous = self.callable.lock().replace(Box::new(f));
        debug_assert!(previous.is_none(), "callable installed twice");
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    #[must_use]
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self.state(), TaskState::Completed | TaskState::Abandoned)
    }

    #[must_use]
    pub fn user_data(&self) -> *mut () {
        self.user_data.load(Ordering::Acquire)
    }

    pub fn set_user_data(&self, data: *mut ()) {
        self.user_data.store(data, Ordering::Release);
    }

    pub(crate) fn transition(&self, from: TaskState, to: TaskState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Best-effort attempt to pull a scheduled task back out of its queue.
    ///
    /// Returns true iff the state moved back to `Created` before an executor
    /// claimed the task; the task may then be launched again. A retracted
    /// task still occupies its queue slot, executors skip it when they reach
    /// it.
    pub fn retract(&self) -> bool {
        let retracted = self.transition(TaskState::Scheduled, TaskState::Created);
        if !retracted {
            tracing::trace!(task = self.name, "retract lost to an executor");
        }
        retracted
    }

    /// Runs the callable on the calling thread.
    ///
    /// The caller must have claimed the task by transitioning it to
    /// `Executing`.
    pub(crate) fn execute(&self) {
        debug_assert_eq!(self.state(), TaskState::Executing);
        let callable = self.callable.lock().take();

        let span = tracing::trace_span!("task", task.name = self.name);
        let _span = span.enter();
        if let Some(callable) = callable {
            callable();
        }

        self.state
            .store(TaskState::Completed as u8, Ordering::Release);
        self.finished.notify();
    }

    /// Discards a task without running it and releases any waiters.
    ///
    /// Dropping the callable here also drops its captures, which is what
    /// breaks the task-captures-its-own-handle cycle the limiter creates.
    pub(crate) fn abandon(&self) {
        drop(self.callable.lock().take());
        self.state
            .store(TaskState::Abandoned as u8, Ordering::Release);
        self.finished.notify();
    }

    pub(crate) fn finished(&self) -> &EventCount {
        &self.finished
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
