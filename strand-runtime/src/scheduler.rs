//! # Cooperative Fiber Scheduler
//!
//! Pluggable policy deciding where and when ready fibers run.
//!
//! ## Design
//!
//! - A fiber never runs on its own: whenever it has work (a start, a resume,
//!   an interrupt signal) it hands a drain task to its [`Scheduler`].
//! - The interpreter counts reduction steps and, once the fiber's budget is
//!   spent, asks [`Scheduler::should_yield`] whether to give up the thread.
//! - [`Executor`] is a single cooperative host loop with one FIFO queue per
//!   [`Priority`]. Each turn drains a snapshot of the queues, highest priority
//!   first, so work scheduled during a turn waits for the next one.
//! - [`WorkerPool`] runs N independent executors on named OS threads. Root
//!   fibers are assigned round-robin and their children stay on the same
//!   executor, so executors own disjoint sets of fibers.
//!
//! ## Technical References
//!
//! - [crossbeam-deque](https://docs.rs/crossbeam-deque) `Injector` queues
//! - [Tokio Scheduler](https://tokio.rs/blog/2019-10-scheduler)

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_deque::{Injector, Steal};
use parking_lot::{Condvar, Mutex};

use crate::cause::Defect;
use crate::fiber::{FiberId, Priority};

/// A unit of work handed to a scheduler.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Shared handle to a scheduler, as stored in the `current_scheduler` fiber ref.
pub type SchedulerRef = Arc<dyn Scheduler>;

/// How long an idle executor sleeps before re-checking its stop condition.
const IDLE_WAIT: Duration = Duration::from_millis(10);

/// Scheduling policy for fibers.
pub trait Scheduler: Send + Sync + 'static {
    /// Queue `task` to run later at `priority`.
    fn schedule_task(&self, task: Task, priority: Priority);

    /// Called when `fiber` has spent its step budget. `Some(priority)` makes
    /// the fiber yield and be re-queued at that priority.
    fn should_yield(&self, fiber: FiberId) -> Option<Priority> {
        let _ = fiber;
        Some(Priority::Normal)
    }

    /// The scheduler a new root fiber should run on, if this scheduler
    /// delegates to others.
    fn assign_root(&self) -> Option<SchedulerRef> {
        None
    }
}

// ============================================================================
// Executor
// ============================================================================

/// A single-threaded cooperative run loop.
///
/// Tasks may be scheduled from any thread; they run on whichever thread
/// drives the executor (`run_turn`, `run_until_idle`, `run_until`).
pub struct Executor {
    /// One queue per priority, indexed by `Priority::index`.
    queues: [Injector<Task>; 4],
    /// Tasks queued but not yet run.
    pending: AtomicUsize,
    /// Tasks run since creation.
    completed: AtomicUsize,
    /// Wake-up signalling for threads blocked in `run_until`.
    signal: Mutex<()>,
    wakeup: Condvar,
}

impl Executor {
    /// Create an empty executor.
    pub fn new() -> Self {
        Self {
            queues: [
                Injector::new(),
                Injector::new(),
                Injector::new(),
                Injector::new(),
            ],
            pending: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            signal: Mutex::new(()),
            wakeup: Condvar::new(),
        }
    }

    /// Number of queued tasks.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Number of tasks run so far.
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Acquire)
    }

    /// Check if no task is queued.
    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }

    /// Wake any thread blocked in `run_until`.
    pub fn wake(&self) {
        let _guard = self.signal.lock();
        self.wakeup.notify_all();
    }

    fn pop(&self, priority: Priority) -> Option<Task> {
        loop {
            match self.queues[priority.index()].steal() {
                Steal::Success(task) => {
                    self.pending.fetch_sub(1, Ordering::AcqRel);
                    return Some(task);
                }
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    fn run_task(&self, task: Task) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
            let defect = Defect::from_panic(payload);
            tracing::error!(panic = %defect, "scheduled task panicked");
        }
        self.completed.fetch_add(1, Ordering::AcqRel);
    }

    /// Run the tasks queued at the start of the turn, highest priority first.
    ///
    /// Returns the number of tasks run.
    pub fn run_turn(&self) -> usize {
        let mut snapshot = [0usize; 4];
        for priority in Priority::DESCENDING {
            snapshot[priority.index()] = self.queues[priority.index()].len();
        }

        let mut ran = 0;
        for priority in Priority::DESCENDING {
            for _ in 0..snapshot[priority.index()] {
                match self.pop(priority) {
                    Some(task) => {
                        self.run_task(task);
                        ran += 1;
                    }
                    None => break,
                }
            }
        }
        ran
    }

    /// Run turns until no task is left.
    ///
    /// Returns the number of tasks run.
    pub fn run_until_idle(&self) -> usize {
        let mut total = 0;
        loop {
            let ran = self.run_turn();
            total += ran;
            if ran == 0 && self.is_idle() {
                return total;
            }
        }
    }

    /// Drive the executor on the calling thread until `done` returns true,
    /// sleeping while there is nothing to run.
    pub fn run_until(&self, done: impl Fn() -> bool) {
        loop {
            if done() {
                return;
            }
            if self.run_turn() > 0 {
                continue;
            }
            let mut guard = self.signal.lock();
            if self.is_idle() && !done() {
                self.wakeup.wait_for(&mut guard, IDLE_WAIT);
            }
        }
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for Executor {
    fn schedule_task(&self, task: Task, priority: Priority) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.queues[priority.index()].push(task);
        self.wake();
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("pending", &self.pending())
            .field("completed", &self.completed())
            .finish()
    }
}

// ============================================================================
// Worker pool
// ============================================================================

/// N executors, each driven by its own named OS thread.
///
/// Threads are started lazily on first use.
pub struct WorkerPool {
    /// The executors, one per worker.
    executors: Vec<Arc<Executor>>,
    /// Worker threads, once started.
    threads: Mutex<Vec<JoinHandle<()>>>,
    /// Whether the worker threads were started.
    started: AtomicBool,
    /// Shutdown flag.
    shutdown: Arc<AtomicBool>,
    /// Round-robin cursor.
    next: AtomicUsize,
}

impl WorkerPool {
    /// Create a pool with `num_workers` executors (at least one).
    pub fn new(num_workers: usize) -> Self {
        let num_workers = num_workers.max(1);
        Self {
            executors: (0..num_workers).map(|_| Arc::new(Executor::new())).collect(),
            threads: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            shutdown: Arc::new(AtomicBool::new(false)),
            next: AtomicUsize::new(0),
        }
    }

    /// Get the number of workers.
    pub fn num_workers(&self) -> usize {
        self.executors.len()
    }

    /// Check if the pool is shutting down.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn ensure_started(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut threads = self.threads.lock();
        for (i, executor) in self.executors.iter().enumerate() {
            let executor = Arc::clone(executor);
            let shutdown = Arc::clone(&self.shutdown);
            let spawned = thread::Builder::new()
                .name(format!("strand-worker-{}", i))
                .spawn(move || {
                    tracing::debug!(worker = i, "worker started");
                    executor.run_until(|| shutdown.load(Ordering::Acquire));
                    tracing::debug!(worker = i, "worker stopped");
                });
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(err) => tracing::error!(worker = i, error = %err, "failed to spawn worker thread"),
            }
        }
    }

    fn pick(&self) -> &Arc<Executor> {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.executors.len();
        &self.executors[i]
    }

    /// Stop the workers and wait for them to exit. Queued tasks are dropped.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        for executor in &self.executors {
            executor.wake();
        }
        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            if handle.thread().id() == thread::current().id() {
                continue;
            }
            let _ = handle.join();
        }
    }
}

impl Scheduler for WorkerPool {
    fn schedule_task(&self, task: Task, priority: Priority) {
        self.ensure_started();
        self.pick().schedule_task(task, priority);
    }

    fn assign_root(&self) -> Option<SchedulerRef> {
        self.ensure_started();
        let executor: SchedulerRef = self.pick().clone();
        Some(executor)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("num_workers", &self.num_workers())
            .field("started", &self.started.load(Ordering::Acquire))
            .finish()
    }
}

/// The process-wide default scheduler: a single-worker pool, started lazily.
///
/// This is the initial value of the `current_scheduler` fiber ref.
pub fn default_scheduler() -> SchedulerRef {
    static DEFAULT: OnceLock<SchedulerRef> = OnceLock::new();
    DEFAULT
        .get_or_init(|| Arc::new(WorkerPool::new(1)))
        .clone()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;
    use std::time::Instant;

    #[test]
    fn test_run_until_idle_runs_everything() {
        let executor = Executor::new();
        let counter = Arc::new(AtomicI32::new(0));
        for _ in 0..10 {
            let c = counter.clone();
            executor.schedule_task(
                Box::new(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                }),
                Priority::Normal,
            );
        }
        assert_eq!(executor.pending(), 10);
        assert_eq!(executor.run_until_idle(), 10);
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        assert!(executor.is_idle());
    }

    #[test]
    fn test_turn_runs_highest_priority_first() {
        let executor = Executor::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (label, priority) in [
            ("low", Priority::Low),
            ("normal", Priority::Normal),
            ("critical", Priority::Critical),
            ("high", Priority::High),
        ] {
            let order = order.clone();
            executor.schedule_task(Box::new(move || order.lock().push(label)), priority);
        }
        executor.run_turn();
        assert_eq!(*order.lock(), vec!["critical", "high", "normal", "low"]);
    }

    #[test]
    fn test_work_scheduled_during_turn_waits() {
        let executor = Arc::new(Executor::new());
        let counter = Arc::new(AtomicI32::new(0));
        let (exec, c) = (executor.clone(), counter.clone());
        executor.schedule_task(
            Box::new(move || {
                let c2 = c.clone();
                exec.schedule_task(
                    Box::new(move || {
                        c2.fetch_add(1, Ordering::SeqCst);
                    }),
                    Priority::Normal,
                );
            }),
            Priority::Normal,
        );
        assert_eq!(executor.run_turn(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(executor.run_turn(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_task_is_contained() {
        let executor = Executor::new();
        executor.schedule_task(Box::new(|| panic!("task blew up")), Priority::Normal);
        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();
        executor.schedule_task(
            Box::new(move || r.store(true, Ordering::SeqCst)),
            Priority::Normal,
        );
        assert_eq!(executor.run_until_idle(), 2);
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_run_until_wakes_on_cross_thread_schedule() {
        let executor = Arc::new(Executor::new());
        let done = Arc::new(AtomicBool::new(false));
        let (exec, d) = (executor.clone(), done.clone());
        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            exec.schedule_task(
                Box::new(move || d.store(true, Ordering::SeqCst)),
                Priority::High,
            );
        });
        let started = Instant::now();
        executor.run_until(|| done.load(Ordering::SeqCst));
        assert!(started.elapsed() < Duration::from_secs(5));
        producer.join().unwrap();
    }

    #[test]
    fn test_pending_never_underflows_while_draining() {
        const TASKS: usize = 20_000;
        let executor = Arc::new(Executor::new());
        let producing = Arc::new(AtomicBool::new(true));
        let (exec, flag) = (executor.clone(), producing.clone());
        let producer = thread::spawn(move || {
            for _ in 0..TASKS {
                exec.schedule_task(Box::new(|| {}), Priority::Normal);
            }
            flag.store(false, Ordering::SeqCst);
        });
        while producing.load(Ordering::SeqCst) {
            executor.run_turn();
            assert!(executor.pending() <= TASKS);
        }
        producer.join().unwrap();
        executor.run_until_idle();
        assert_eq!(executor.completed(), TASKS);
        assert_eq!(executor.pending(), 0);
    }

    #[test]
    fn test_worker_pool_runs_tasks() {
        let pool = WorkerPool::new(2);
        assert_eq!(pool.num_workers(), 2);
        let counter = Arc::new(AtomicI32::new(0));
        for _ in 0..100 {
            let c = counter.clone();
            pool.schedule_task(
                Box::new(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                }),
                Priority::Normal,
            );
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) < 100 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 100);
        pool.shutdown();
        assert!(pool.is_shutting_down());
    }

    #[test]
    fn test_assign_root_round_robin() {
        let pool = WorkerPool::new(2);
        let a = pool.assign_root();
        let b = pool.assign_root();
        let c = pool.assign_root();
        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &c));
    }
}
