// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The low-level task system: tasks, the work-stealing scheduler, cooperative
//! cancellation and the concurrency limiter.
//!
//! A [`Task`] is a named, prioritized callable with an atomic state machine
//! (`Created → Scheduled → Executing → Completed`, plus a best-effort
//! [`retract`](Task::retract) back to `Created` while still queued).
//! [`Scheduler`] runs one worker per core (minus one); workers prefer their
//! own deque for cache locality, then steal from random peers, then fall back
//! to the global per-priority queues, and park on an event-count when
//! everything is dry.
//!
//! Blocking inside a task is legal but starves a worker; pair it with an
//! [`OversubscriptionScope`] so the scheduler keeps an extra worker awake for
//! the duration.
//!
//! [`ConcurrencyLimiter`] fairly multiplexes any number of pushed closures
//! over at most `max_concurrency` slots, handing each invocation a slot index
//! that can address per-slot scratch data without further synchronization.

mod cancel;
mod deque;
mod limiter;
mod scheduler;
mod slots;
mod task;

pub use cancel::{CancellationToken, CancellationTokenScope};
pub use limiter::ConcurrencyLimiter;
pub use scheduler::{
    OversubscriptionScope, QueuePreference, Scheduler, SchedulerConfig, global_scheduler,
    spawn_task, wait_for_task,
};
pub use task::{Priority, Task, TaskRef, TaskState};
