// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::deque::{Steal, StealDeque};
use crate::task::{Priority, Task, TaskRef, TaskState};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use emtime::{TimePoint, TimeSpan};
use links::FifoList;
use std::cell::RefCell;
use std::sync::{Arc, OnceLock, Weak};
use sync::{Backoff, EventCount};
use util::non_null;

/// Where a launch should enqueue the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePreference {
    /// The global queue of the task's priority. Always valid.
    Global,
    /// The calling worker's own deque; falls back to the global queue when
    /// the caller is not a worker or its deque is full. Skipping the wake-up
    /// alongside this lets the current worker pick the task up itself.
    Local,
}

/// Construction parameters for a [`Scheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Standard worker count. Defaults to hardware concurrency minus one.
    pub workers: usize,
    /// Extra workers kept in reserve for oversubscription scopes.
    pub reserve_workers: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(2);
        Self {
            workers: parallelism.saturating_sub(1).max(1),
            reserve_workers: 2,
        }
    }
}

const LOCAL_QUEUE_CAPACITY: usize = 256;
const STEAL_ROUNDS: usize = 4;

struct WorkerShared {
    deque: StealDeque<Task>,
}

pub(crate) struct SchedulerInner {
    /// One MPMC queue per priority, drained `High → Default → Background`.
    global_queues: [FifoList<Task>; Priority::COUNT],
    /// One deque per worker, standard workers first, reserves after.
    locals: Box<[WorkerShared]>,
    num_standard: usize,
    /// Workers park here when every queue is dry.
    idle: EventCount,
    /// Inactive reserve workers park here until an oversubscription scope
    /// raises the counter past their rank.
    reserve_gate: EventCount,
    oversubscription: AtomicUsize,
    stop: AtomicBool,
}

/// The work-stealing task scheduler.
///
/// Owns one worker thread per configured slot. Workers prefer their own
/// deque (newest first, for cache locality), then steal from random peers
/// (oldest first), then take from the global priority queues, and park on an
/// event-count when everything is empty.
///
/// Dropping the scheduler stops the workers, joins them, and abandons any
/// tasks still queued (their waiters are released). Most code uses the
/// process-wide instance via [`global_scheduler`] or [`spawn_task`]; tests
/// construct private instances for isolation.
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    threads: Vec<std::thread::JoinHandle<()>>,
}

thread_local! {
    /// Set for the lifetime of a worker thread; lets launches with
    /// [`QueuePreference::Local`] find the worker's own deque.
    static CURRENT_WORKER: RefCell<Option<(Weak<SchedulerInner>, usize)>> =
        const { RefCell::new(None) };
}

// === impl Scheduler ===

impl Scheduler {
    /// Starts a scheduler with the default configuration.
    #[must_use]
    pub fn start() -> Self {
        Self::with_config(&SchedulerConfig::default())
    }

    /// Starts a scheduler with `config` workers.
    ///
    /// # Panics
    ///
    /// Panics if worker threads cannot be spawned.
    #[must_use]
    pub fn with_config(config: &SchedulerConfig) -> Self {
        let num_standard = config.workers.max(1);
        let total = num_standard + config.reserve_workers;

        let inner = Arc::new(SchedulerInner {
            global_queues: [FifoList::new(), FifoList::new(), FifoList::new()],
            locals: (0..total)
                .map(|_| WorkerShared {
                    deque: StealDeque::with_capacity(LOCAL_QUEUE_CAPACITY),
                })
                .collect(),
            num_standard,
            idle: EventCount::new(),
            reserve_gate: EventCount::new(),
            oversubscription: AtomicUsize::new(0),
            stop: AtomicBool::new(false),
        });

        let threads = (0..total)
            .map(|rank| {
                let inner = Arc::clone(&inner);
                let name = if rank < num_standard {
                    format!("ember-worker-{rank}")
                } else {
                    format!("ember-reserve-{}", rank - num_standard)
                };
                std::thread::Builder::new()
                    .name(name)
                    .spawn(move || {
                        CURRENT_WORKER.with(|current| {
                            *current.borrow_mut() = Some((Arc::downgrade(&inner), rank));
                        });
                        if rank < inner.num_standard {
                            inner.worker_main(rank);
                        } else {
                            inner.reserve_main(rank);
                        }
                    })
                    .expect("failed to spawn scheduler worker")
            })
            .collect();

        Self { inner, threads }
    }

    /// Number of standard workers.
    #[must_use]
    pub fn num_workers(&self) -> usize {
        self.inner.num_standard
    }

    /// Attempts to launch a task, transitioning it `Created → Scheduled`.
    ///
    /// Returns false if the task was not in the `Created` state; scheduled
    /// and executing tasks cannot be launched again.
    pub fn try_launch(
        &self,
        task: &TaskRef,
        preference: QueuePreference,
        wake_worker: bool,
    ) -> bool {
        self.inner.try_launch(task, preference, wake_worker)
    }

    /// Blocks until `task` completes, executing it inline when possible.
    ///
    /// If the task is still sitting in a queue, the calling thread claims and
    /// runs it instead of waiting; otherwise the caller sleeps on the task's
    /// event-count. Returns false on timeout.
    pub fn wait_for_task(&self, task: &TaskRef, timeout: TimeSpan) -> bool {
        wait_for_task(task, timeout)
    }

    /// Enters an oversubscription scope on this scheduler.
    ///
    /// Hold the returned scope across a known-blocking operation inside a
    /// task so a reserve worker compensates for the blocked one.
    #[must_use]
    pub fn oversubscribe(&self) -> OversubscriptionScope {
        OversubscriptionScope::enter(Arc::clone(&self.inner))
    }

    pub(crate) fn inner(&self) -> &Arc<SchedulerInner> {
        &self.inner
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.inner.stop.store(true, Ordering::Release);
        self.inner.idle.notify();
        self.inner.reserve_gate.notify();

        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }

        self.inner.abandon_queued();
    }
}

// === impl SchedulerInner ===

impl SchedulerInner {
    pub(crate) fn try_launch(
        &self,
        task: &TaskRef,
        preference: QueuePreference,
        wake_worker: bool,
    ) -> bool {
        if !task.transition(TaskState::Created, TaskState::Scheduled) {
            tracing::trace!(task = task.name(), state = ?task.state(), "launch rejected");
            return false;
        }

        self.enqueue(Arc::clone(task), preference);
        if wake_worker {
            self.idle.notify();
        }
        true
    }

    fn enqueue(&self, task: TaskRef, preference: QueuePreference) {
        let priority = task.priority();
        let mut raw = into_raw(task);

        if preference == QueuePreference::Local {
            let local = CURRENT_WORKER.with(|current| {
                current.borrow().as_ref().and_then(|(scheduler, rank)| {
                    core::ptr::eq(scheduler.as_ptr(), core::ptr::from_ref(self))
                        .then_some(*rank)
                })
            });
            if let Some(rank) = local {
                match self.locals[rank].deque.push(raw) {
                    Ok(()) => return,
                    // Deque full: overflow into the global queue.
                    Err(rejected) => raw = rejected,
                }
            }
        }

        self.global_queues[priority.index()].push(raw);
    }

    fn worker_main(&self, rank: usize) {
        let _span = tracing::debug_span!("worker main loop", worker = rank).entered();
        let mut rng = fastrand::Rng::with_seed(0x9E37_79B9_7F4A_7C15 ^ rank as u64);

        loop {
            if self.stop.load(Ordering::Acquire) {
                tracing::debug!(worker = rank, "stop signal received, shutting down");
                break;
            }

            if let Some(task) = self.find_work(rank, &mut rng) {
                self.run_task(task);
                continue;
            }

            let token = self.idle.prepare_wait();
            if self.has_pending_work() || self.stop.load(Ordering::Acquire) {
                continue;
            }
            tracing::trace!(worker = rank, "going to sleep");
            self.idle.wait(token);
        }
    }

    fn reserve_main(&self, rank: usize) {
        let reserve_index = rank - self.num_standard;
        let _span =
            tracing::debug_span!("reserve worker main loop", reserve = reserve_index).entered();
        let mut rng = fastrand::Rng::with_seed(0xD1B5_4A32_D192_ED03 ^ rank as u64);

        loop {
            if self.stop.load(Ordering::Acquire) {
                break;
            }

            if self.oversubscription.load(Ordering::Acquire) > reserve_index {
                // Active: substitute for a blocked worker.
                if let Some(task) = self.find_work(rank, &mut rng) {
                    self.run_task(task);
                    continue;
                }
                let token = self.idle.prepare_wait();
                if self.has_pending_work() || self.stop.load(Ordering::Acquire) {
                    continue;
                }
                self.idle.wait(token);
            } else {
                let token = self.reserve_gate.prepare_wait();
                if self.stop.load(Ordering::Acquire)
                    || self.oversubscription.load(Ordering::Acquire) > reserve_index
                {
                    continue;
                }
                self.reserve_gate.wait(token);
            }
        }
    }

    fn find_work(&self, rank: usize, rng: &mut fastrand::Rng) -> Option<TaskRef> {
        // Own deque first: newest work, hottest cache.
        if let Some(raw) = self.locals[rank].deque.pop() {
            return Some(from_raw(raw));
        }

        // Steal from random peers, oldest work first.
        let num_victims = self.locals.len();
        if num_victims > 1 {
            let mut backoff = Backoff::new();
            for _ in 0..STEAL_ROUNDS {
                let start = rng.usize(..num_victims);
                for offset in 0..num_victims {
                    let victim = (start + offset) % num_victims;
                    if victim == rank {
                        continue;
                    }
                    loop {
                        match self.locals[victim].deque.steal() {
                            Steal::Success(raw) => {
                                tracing::trace!(worker = rank, victim, "stole a task");
                                return Some(from_raw(raw));
                            }
                            Steal::Empty => break,
                            Steal::Retry => {
                                backoff.spin();
                            }
                        }
                    }
                }
                backoff.spin();
            }
        }

        // Global queues, highest priority first.
        self.global_queues
            .iter()
            .find_map(|queue| queue.pop().map(from_raw))
    }

    fn run_task(&self, task: TaskRef) {
        // A retract may have pulled the task back out from under us; the
        // failed claim is the skip.
        if task.transition(TaskState::Scheduled, TaskState::Executing) {
            task.execute();
        }
    }

    fn has_pending_work(&self) -> bool {
        self.global_queues.iter().any(|queue| !queue.is_empty())
            || self.locals.iter().any(|local| !local.deque.is_empty())
    }

    /// Drains every queue after the workers have exited, abandoning tasks
    /// that never ran so their waiters are released.
    fn abandon_queued(&self) {
        let mut drain = |task: TaskRef| {
            if task.transition(TaskState::Scheduled, TaskState::Executing) {
                task.abandon();
            }
        };

        for queue in &self.global_queues {
            while let Some(raw) = queue.pop() {
                drain(from_raw(raw));
            }
        }
        for local in self.locals.iter() {
            loop {
                match local.deque.steal() {
                    Steal::Success(raw) => drain(from_raw(raw)),
                    Steal::Empty => break,
                    Steal::Retry => {}
                }
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

/// RAII region during which the scheduler keeps an extra worker awake to
/// compensate for a known-blocking call.
#[must_use = "the scope releases its extra worker when dropped"]
pub struct OversubscriptionScope {
    inner: Arc<SchedulerInner>,
}

// === impl OversubscriptionScope ===

impl OversubscriptionScope {
    /// Enters a scope on the process-wide scheduler.
    pub fn enter_global() -> Self {
        Self::enter(Arc::clone(global_scheduler().inner()))
    }

    pub(crate) fn enter(inner: Arc<SchedulerInner>) -> Self {
        inner.oversubscription.fetch_add(1, Ordering::AcqRel);
        inner.reserve_gate.notify();
        Self { inner }
    }
}

impl Drop for OversubscriptionScope {
    fn drop(&mut self) {
        self.inner.oversubscription.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The process-wide scheduler, started on first use and never torn down.
///
/// Skipping destruction is deliberate: worker threads and queued tasks may
/// outlive any particular teardown order, and a scheduler that never
/// destructs cannot be used after free during process exit.
pub fn global_scheduler() -> &'static Scheduler {
    static GLOBAL: OnceLock<Scheduler> = OnceLock::new();
    GLOBAL.get_or_init(Scheduler::start)
}

/// Launches `f` as a task on the process-wide scheduler.
pub fn spawn_task(
    name: &'static str,
    priority: Priority,
    f: impl FnOnce() + Send + 'static,
) -> TaskRef {
    let task = Task::new(name, priority, f);
    let launched = global_scheduler().try_launch(&task, QueuePreference::Global, true);
    debug_assert!(launched, "freshly created tasks always launch");
    task
}

/// Blocks until `task` completes, executing it inline when possible.
///
/// Independent of which scheduler the task was launched on. Returns false on
/// timeout; a completed or abandoned task always returns true.
pub fn wait_for_task(task: &TaskRef, timeout: TimeSpan) -> bool {
    let deadline = if timeout.is_infinite() {
        TimePoint::INFINITE
    } else {
        TimePoint::now() + timeout
    };

    loop {
        if task.is_completed() {
            return true;
        }

        // Serve as the executor instead of sleeping if the task is still
        // queued.
        if task.transition(TaskState::Scheduled, TaskState::Executing) {
            task.execute();
            return true;
        }

        let token = task.finished().prepare_wait();
        if task.is_completed() {
            return true;
        }
        let remaining = deadline.remaining_from(TimePoint::now());
        if !task.finished().wait_for(token, remaining) && TimePoint::now() >= deadline {
            return task.is_completed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn test_scheduler(workers: usize) -> Scheduler {
        Scheduler::with_config(&SchedulerConfig {
            workers,
            reserve_workers: 1,
        })
    }

    #[test]
    fn spawned_task_runs_to_completion() {
        let scheduler = test_scheduler(2);
        let ran = Arc::new(AtomicBool::new(false));

        let task = Task::new("smoke", Priority::Default, {
            let ran = Arc::clone(&ran);
            move || ran.store(true, Ordering::Release)
        });
        assert!(scheduler.try_launch(&task, QueuePreference::Global, true));
        assert!(scheduler.wait_for_task(&task, TimeSpan::INFINITE));

        assert!(ran.load(Ordering::Acquire));
        assert_eq!(task.state(), TaskState::Completed);
    }

    #[test]
    fn double_launch_is_rejected() {
        let scheduler = test_scheduler(1);
        let task = Task::new("once", Priority::Default, || {});
        assert!(scheduler.try_launch(&task, QueuePreference::Global, true));
        assert!(!scheduler.try_launch(&task, QueuePreference::Global, true));
        assert!(scheduler.wait_for_task(&task, TimeSpan::INFINITE));
    }

    #[test]
    fn waiting_caller_executes_inline() {
        // A scheduler whose single worker is busy: the waiter must run the
        // task itself rather than deadlock.
        let scheduler = test_scheduler(1);

        let gate = Arc::new(AtomicBool::new(false));
        let blocker = Task::new("blocker", Priority::Default, {
            let gate = Arc::clone(&gate);
            move || {
                while !gate.load(Ordering::Acquire) {
                    std::thread::yield_now();
                }
            }
        });
        assert!(scheduler.try_launch(&blocker, QueuePreference::Global, true));

        let task = Task::new("inline", Priority::Default, || {});
        assert!(scheduler.try_launch(&task, QueuePreference::Global, true));
        assert!(scheduler.wait_for_task(&task, TimeSpan::INFINITE));
        assert_eq!(task.state(), TaskState::Completed);

        gate.store(true, Ordering::Release);
        assert!(scheduler.wait_for_task(&blocker, TimeSpan::INFINITE));
    }

    #[test]
    fn retracted_task_is_skipped_and_relaunchable() {
        let scheduler = test_scheduler(1);

        // Park the single worker behind a long-running task so the retract
        // can win the race.
        let gate = Arc::new(AtomicBool::new(false));
        let blocker = Task::new("blocker", Priority::Default, {
            let gate = Arc::clone(&gate);
            move || {
                while !gate.load(Ordering::Acquire) {
                    std::thread::yield_now();
                }
            }
        });
        assert!(scheduler.try_launch(&blocker, QueuePreference::Global, true));

        let counter = Arc::new(AtomicU32::new(0));
        let task = Task::new("retractable", Priority::Default, {
            let counter = Arc::clone(&counter);
            move || {
                counter.fetch_add(1, Ordering::AcqRel);
            }
        });
        assert!(scheduler.try_launch(&task, QueuePreference::Global, true));
        assert!(task.retract());
        assert_eq!(task.state(), TaskState::Created);

        gate.store(true, Ordering::Release);
        assert!(scheduler.wait_for_task(&blocker, TimeSpan::INFINITE));

        // The queue entry for the retracted task is skipped, not executed.
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(counter.load(Ordering::Acquire), 0);

        // Relaunch actually runs it.
        assert!(scheduler.try_launch(&task, QueuePreference::Global, true));
        assert!(scheduler.wait_for_task(&task, TimeSpan::INFINITE));
        assert_eq!(counter.load(Ordering::Acquire), 1);
    }

    #[test]
    fn priorities_drain_high_first() {
        // One worker, kept busy while we queue one task per priority; the
        // worker must pick them up High → Default → Background.
        let scheduler = test_scheduler(1);

        let gate = Arc::new(AtomicBool::new(false));
        let blocker = Task::new("blocker", Priority::High, {
            let gate = Arc::clone(&gate);
            move || {
                while !gate.load(Ordering::Acquire) {
                    std::thread::yield_now();
                }
            }
        });
        assert!(scheduler.try_launch(&blocker, QueuePreference::Global, true));
        std::thread::sleep(std::time::Duration::from_millis(10));

        let order = Arc::new(sync::Mutex::new(Vec::new()));
        let mut tasks = Vec::new();
        for priority in [Priority::Background, Priority::Default, Priority::High] {
            let task = Task::new("ordered", priority, {
                let order = Arc::clone(&order);
                move || order.lock().push(priority)
            });
            assert!(scheduler.try_launch(&task, QueuePreference::Global, false));
            tasks.push(task);
        }

        gate.store(true, Ordering::Release);
        // Poll rather than wait_for_task: waiting would execute the tasks
        // inline on this thread and scramble the drain order under test.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while !tasks.iter().all(|task| task.is_completed()) {
            assert!(std::time::Instant::now() < deadline, "tasks never drained");
            std::thread::yield_now();
        }

        assert_eq!(
            *order.lock(),
            vec![Priority::High, Priority::Default, Priority::Background]
        );
    }

    #[test]
    fn many_tasks_complete_across_workers() {
        use tracing_subscriber::EnvFilter;
        use tracing_subscriber::util::SubscriberInitExt;

        const TASKS: u32 = 1000;

        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_thread_names(true)
            .set_default();

        let scheduler = test_scheduler(4);
        let counter = Arc::new(AtomicU32::new(0));

        let tasks: Vec<_> = (0..TASKS)
            .map(|_| {
                let task = Task::new("burst", Priority::Default, {
                    let counter = Arc::clone(&counter);
                    move || {
                        counter.fetch_add(1, Ordering::AcqRel);
                    }
                });
                assert!(scheduler.try_launch(&task, QueuePreference::Global, true));
                task
            })
            .collect();

        for task in &tasks {
            assert!(scheduler.wait_for_task(task, TimeSpan::INFINITE));
        }
        assert_eq!(counter.load(Ordering::Acquire), TASKS);
    }

    #[test]
    fn global_spawn_with_cooperative_cancel() {
        use crate::cancel::{CancellationToken, CancellationTokenScope};

        let token = CancellationToken::new();
        token.cancel();

        let bailed_out = Arc::new(AtomicBool::new(false));
        let task = spawn_task("cancelable", Priority::Default, {
            let token = token.clone();
            let bailed_out = Arc::clone(&bailed_out);
            move || {
                let _scope = CancellationTokenScope::new(&token);
                if CancellationTokenScope::is_current_work_canceled() {
                    bailed_out.store(true, Ordering::Release);
                    return;
                }
                unreachable!("the token was canceled before launch");
            }
        });

        assert!(wait_for_task(&task, TimeSpan::INFINITE));
        assert!(bailed_out.load(Ordering::Acquire));
        assert_eq!(task.state(), TaskState::Completed);
    }

    #[test]
    fn timed_wait_times_out_on_stuck_task() {
        let scheduler = test_scheduler(1);

        let gate = Arc::new(AtomicBool::new(false));
        let blocker = Task::new("stuck", Priority::Default, {
            let gate = Arc::clone(&gate);
            move || {
                while !gate.load(Ordering::Acquire) {
                    std::thread::yield_now();
                }
            }
        });
        assert!(scheduler.try_launch(&blocker, QueuePreference::Global, true));
        std::thread::sleep(std::time::Duration::from_millis(10));

        assert!(!wait_for_task(&blocker, TimeSpan::from_millis(30.0)));
        gate.store(true, Ordering::Release);
        assert!(wait_for_task(&blocker, TimeSpan::INFINITE));
    }

    #[test]
    fn dropping_scheduler_abandons_queued_tasks() {
        let scheduler = test_scheduler(1);

        let gate = Arc::new(AtomicBool::new(false));
        let blocker = Task::new("blocker", Priority::Default, {
            let gate = Arc::clone(&gate);
            move || {
                while !gate.load(Ordering::Acquire) {
                    std::thread::yield_now();
                }
            }
        });
        assert!(scheduler.try_launch(&blocker, QueuePreference::Global, true));
        std::thread::sleep(std::time::Duration::from_millis(10));

        let queued = Task::new("never-runs", Priority::Background, || {
            panic!("abandoned tasks must not execute")
        });
        assert!(scheduler.try_launch(&queued, QueuePreference::Global, false));

        // Stop before releasing the blocker so the worker exits without
        // draining the queue; drop then joins and abandons.
        scheduler.inner.stop.store(true, Ordering::Release);
        gate.store(true, Ordering::Release);
        drop(scheduler);

        assert!(queued.is_completed());
        assert_eq!(queued.state(), TaskState::Abandoned);
        // waiting on an abandoned task does not hang
        assert!(wait_for_task(&queued, TimeSpan::INFINITE));
    }

    #[test]
    fn oversubscription_activates_a_reserve_worker() {
        // One standard worker blocks inside a task while holding a scope; the
        // reserve worker must pick up the second task.
        let scheduler = test_scheduler(1);
        let scope_inner = Arc::clone(scheduler.inner());

        let release = Arc::new(AtomicBool::new(false));
        let side_done = Arc::new(AtomicBool::new(false));

        let blocking = Task::new("blocking-io", Priority::Default, {
            let release = Arc::clone(&release);
            move || {
                let _scope = OversubscriptionScope::enter(scope_inner);
                while !release.load(Ordering::Acquire) {
                    std::thread::yield_now();
                }
            }
        });
        assert!(scheduler.try_launch(&blocking, QueuePreference::Global, true));
        std::thread::sleep(std::time::Duration::from_millis(10));

        let side = Task::new("side", Priority::Default, {
            let side_done = Arc::clone(&side_done);
            move || side_done.store(true, Ordering::Release)
        });
        assert!(scheduler.try_launch(&side, QueuePreference::Global, true));

        // The reserve worker, not the blocked standard worker, runs it.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while !side_done.load(Ordering::Acquire) {
            assert!(std::time::Instant::now() < deadline, "reserve never ran");
            std::thread::yield_now();
        }

        release.store(true, Ordering::Release);
        assert!(scheduler.wait_for_task(&blocking, TimeSpan::INFINITE));
    }
}
