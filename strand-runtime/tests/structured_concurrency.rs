//! Integration tests for the strand runtime.
//!
//! Every test runs effects through a [`Runtime`] and checks observable
//! behavior: values, exits, finalizer order, fiber ref merging and lifecycle
//! notifications.

use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use strand_runtime::{
    current_log_annotations, current_max_ops_before_yield, AnyValue, Cause, Effect, ErasedExit,
    Executor, Exit, Fiber, FiberId, FiberRef, LifecycleCounter, Priority, RunError, Runtime,
    RuntimeConfig, Scheduler, SchedulerRef, Scope, Supervisor, Task, Track,
};

type Log = Arc<Mutex<Vec<String>>>;

fn new_log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

fn push(log: &Log, entry: impl Into<String>) -> Effect<()> {
    let log = log.clone();
    let entry = entry.into();
    Effect::sync(move || log.lock().push(entry.clone()))
}

fn unit_exit() -> ErasedExit {
    let unit: AnyValue = Arc::new(());
    Exit::succeed(unit)
}

/// Yield until `cond` holds.
fn wait_until<F>(cond: F) -> Effect<()>
where
    F: Fn() -> bool + Clone + Send + Sync + 'static,
{
    Effect::suspend(move || {
        if cond() {
            Effect::unit()
        } else {
            let cond = cond.clone();
            Effect::yield_now().flat_map(move |_| wait_until(cond.clone()))
        }
    })
}

// ============================================================================
// Basic evaluation
// ============================================================================

#[test]
fn test_flat_map_succeeds() {
    let program = Effect::<i32, String>::succeed(1).flat_map(|n| Effect::succeed(n + 1));
    assert_eq!(Runtime::default().run_sync(program), Ok(2));
}

#[test]
fn test_catch_all_recovers() {
    let program = Effect::<i32, String>::fail("boom".to_string())
        .catch_all(|_| Effect::<i32, String>::succeed(4));
    assert_eq!(Runtime::default().run_sync(program), Ok(4));
}

#[test]
fn test_failure_reported_with_cause() {
    let program = Effect::<i32, String>::fail("boom".to_string()).map(|n| n + 1);
    match Runtime::default().run_sync(program) {
        Err(RunError::Failed { cause, rendered }) => {
            assert_eq!(cause, Cause::Fail("boom".to_string()));
            assert!(rendered.contains("boom"));
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

#[test]
fn test_effects_are_descriptions() {
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();
    let effect = Effect::<usize, String>::sync(move || counter.fetch_add(1, Ordering::SeqCst) + 1);

    let runtime = Runtime::default();
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert_eq!(runtime.run_sync(effect.clone()), Ok(1));
    assert_eq!(runtime.run_sync(effect.clone()), Ok(2));

    let twice = effect.clone().zip(effect);
    assert_eq!(runtime.run_sync(twice), Ok((3, 4)));
}

#[test]
fn test_deep_flat_map_chain() {
    let depth = 100_000u64;
    let program = (0..depth).fold(Effect::<u64, String>::succeed(0), |effect, _| {
        effect.flat_map(|n| Effect::succeed(n + 1))
    });
    assert_eq!(Runtime::default().run_sync(program), Ok(depth));
}

fn count_down(n: u64) -> Effect<u64, String> {
    if n == 0 {
        Effect::succeed(0)
    } else {
        Effect::suspend(move || count_down(n - 1)).map(|x| x + 1)
    }
}

#[test]
fn test_deep_right_nested_recursion() {
    assert_eq!(Runtime::default().run_sync(count_down(100_000)), Ok(100_000));
}

#[test]
fn test_panicking_sync_is_a_defect() {
    let program = Effect::<i32, String>::sync(|| -> i32 { panic!("kaboom") });
    let exit = Runtime::default().run_sync_exit(program);
    let cause = exit.cause().expect("fiber should fail");
    assert!(cause.is_die());
    assert!(cause.defects()[0].message().contains("kaboom"));
}

#[test]
fn test_panicking_continuation_is_a_defect() {
    let program = Effect::<i32, String>::succeed(1).map(|_| -> i32 { panic!("in map") });
    let result = Runtime::default().run_sync(program);
    assert!(matches!(&result, Err(RunError::Failed { cause, .. }) if cause.is_die()));
}

#[test]
fn test_defects_skip_catch_all() {
    let program = Effect::<i32, String>::die("broken").catch_all(|_| Effect::<i32, String>::succeed(0));
    let exit = Runtime::default().run_sync_exit(program);
    assert!(exit.cause().map(|c| c.is_die()).unwrap_or(false));
}

#[test]
fn test_sandbox_exposes_cause() {
    let program = Effect::<i32, String>::die("broken")
        .sandbox()
        .catch_all(|cause| Effect::<bool, String>::succeed(cause.is_die()).map(|_| 1));
    assert_eq!(Runtime::default().run_sync(program), Ok(1));
}

#[test]
fn test_map_error_and_try_sync() {
    let program = Effect::<i32, String>::try_sync(|| "x".parse::<i32>().map_err(|e| e.to_string()))
        .map_error(|msg| msg.len());
    let exit = Runtime::default().run_sync_exit(program);
    assert!(exit.cause().and_then(|c| c.first_failure().copied()).unwrap_or(0) > 0);
}

#[test]
fn test_exit_reifies_outcome() {
    let program = Effect::<i32, String>::fail("nope".to_string()).exit();
    let exit = Runtime::default().run_sync(program).expect("exit never fails");
    assert_eq!(exit, Exit::fail("nope".to_string()));
}

// ============================================================================
// Async boundaries
// ============================================================================

#[test]
fn test_double_resume_is_ignored() {
    let program = Effect::<i32, String>::async_(|resume| {
        resume.succeed(1);
        resume.succeed(2);
        assert!(resume.is_fired());
    });
    assert_eq!(Runtime::default().run_sync(program), Ok(1));
}

#[test]
fn test_resume_from_another_thread() {
    let program = Effect::<String, String>::async_(|resume| {
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            resume.fail("late".to_string());
        });
    });
    let result = Runtime::default().run_blocking(program);
    assert_eq!(result.err().and_then(|e| e.cause().cloned()), Some(Cause::Fail("late".to_string())));
}

#[test]
fn test_async_boundary_from_run_sync() {
    let result = Runtime::default().run_sync(Effect::<i32, String>::never());
    assert!(matches!(result, Err(RunError::AsyncBoundary(_))));
}

#[test]
fn test_async_interrupt_runs_canceler() {
    let cancelled = Arc::new(AtomicBool::new(false));
    let flag = cancelled.clone();
    let waiting = Effect::<(), String>::async_interrupt(move |_resume| {
        let flag = flag.clone();
        Some(Effect::sync(move || flag.store(true, Ordering::SeqCst)))
    });
    let program = waiting
        .fork()
        .flat_map(|fiber| Effect::yield_now().zip_right(fiber.interrupt()));
    let exit = Runtime::default().run_sync(program).expect("parent succeeds");
    assert!(exit.is_interrupted());
    assert!(cancelled.load(Ordering::SeqCst));
}

// ============================================================================
// Interruption
// ============================================================================

#[test]
fn test_interrupting_a_forked_fiber() {
    let program = Effect::<(), String>::never()
        .fork()
        .flat_map(|fiber| Effect::fiber_id().zip(fiber.interrupt()));
    let (parent, exit) = Runtime::default().run_sync(program).expect("parent succeeds");
    assert!(exit.is_interrupted());
    let interruptors = exit.cause().map(|c| c.interruptors()).unwrap_or_default();
    assert_eq!(interruptors, HashSet::from([parent]));
}

#[test]
fn test_interrupt_self() {
    let exit = Runtime::default().run_sync_exit(Effect::<i32, String>::interrupt());
    assert!(exit.is_interrupted());
    let result = Runtime::default().run_sync(Effect::<i32, String>::interrupt());
    assert!(result.map_err(|e| e.is_interrupted()).unwrap_err());
}

#[test]
fn test_interrupted_parent_finalizes_children_first() {
    const CHILDREN: usize = 5;
    let log = new_log();
    let started = Arc::new(AtomicUsize::new(0));

    let child = |i: usize| {
        let started = started.clone();
        Effect::<(), String>::sync(move || {
            started.fetch_add(1, Ordering::SeqCst);
        })
        .zip_right(Effect::<(), String>::never())
        .ensuring(push(&log, format!("child {}", i)))
    };

    let mut forks: Effect<Vec<Fiber<(), String>>, String> = Effect::succeed(Vec::new());
    for i in 0..CHILDREN {
        let child = child(i);
        forks = forks.flat_map(move |fibers| {
            let child = child.clone();
            child.fork().widen().map(move |fiber| {
                let mut fibers = fibers.clone();
                fibers.push(fiber);
                fibers
            })
        });
    }
    let parent = forks.flat_map(|fibers| {
        fibers
            .into_iter()
            .fold(Effect::<(), String>::succeed(()), |acc, fiber| acc.zip_right(fiber.join()))
    });

    let ready = started.clone();
    let observed = log.clone();
    let program = parent.fork().flat_map(move |fiber| {
        let ready = ready.clone();
        let observed = observed.clone();
        wait_until(move || ready.load(Ordering::SeqCst) == CHILDREN)
            .zip_right(fiber.interrupt())
            .map(move |exit| (exit, observed.lock().len()))
    });

    let (exit, finalized) = Runtime::default().run_sync(program).expect("parent succeeds");
    assert!(exit.is_interrupted());
    assert_eq!(finalized, CHILDREN);
}

#[test]
fn test_uninterruptible_region_defers_interruption() {
    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    let (s, f) = (started.clone(), finished.clone());

    let critical = Effect::<(), String>::sync(move || s.store(true, Ordering::SeqCst))
        .zip_right(Effect::yield_now().widen())
        .zip_right(Effect::yield_now().widen())
        .zip_right(Effect::sync(move || f.store(true, Ordering::SeqCst)))
        .uninterruptible();

    let ready = started.clone();
    let program = critical.fork().flat_map(move |fiber| {
        let ready = ready.clone();
        wait_until(move || ready.load(Ordering::SeqCst)).zip_right(fiber.interrupt())
    });
    let exit = Runtime::default().run_sync(program).expect("parent succeeds");
    assert!(exit.is_interrupted());
    assert!(finished.load(Ordering::SeqCst));
}

#[test]
fn test_on_interrupt_sees_interruptors() {
    let seen = Arc::new(Mutex::new(HashSet::new()));
    let record = seen.clone();
    let program = Effect::<(), String>::never()
        .on_interrupt(move |ids| {
            let record = record.clone();
            Effect::sync(move || record.lock().extend(ids.iter().copied()))
        })
        .fork()
        .flat_map(|fiber| {
            Effect::yield_now()
                .zip_right(fiber.interrupt())
                .zip_right(Effect::fiber_id())
        });
    let parent = Runtime::default().run_sync(program).expect("parent succeeds");
    assert_eq!(*seen.lock(), HashSet::from([parent]));
}

#[test]
fn test_unsafe_interrupt_from_outside() {
    let executor = Arc::new(Executor::new());
    let scheduler: SchedulerRef = executor.clone();
    let runtime = Runtime::new().with_scheduler(scheduler);
    let fiber = runtime.run_fork(Effect::<(), String>::never());
    executor.run_until_idle();
    assert!(!fiber.is_done());

    fiber.unsafe_interrupt();
    assert!(!fiber.is_done());
    assert!(!executor.is_idle());
    executor.run_until_idle();
    let exit = fiber.unsafe_poll().expect("fiber finished");
    assert_eq!(exit.cause().map(|c| c.interruptors()), Some(HashSet::from([FiberId::none()])));
}

// ============================================================================
// Fork and join
// ============================================================================

#[test]
fn test_join_returns_child_value() {
    let program = Effect::<i32, String>::succeed(1)
        .fork()
        .widen()
        .flat_map(|fiber| fiber.join())
        .map(|n| n + 1);
    assert_eq!(Runtime::default().run_sync(program), Ok(2));
}

#[test]
fn test_repeated_join_is_stable() {
    let program = Effect::<i32, String>::fail("child".to_string())
        .fork()
        .flat_map(|fiber| fiber.join().exit().zip(fiber.join().exit()));
    let (first, second) = Runtime::default().run_sync(program).expect("parent succeeds");
    assert_eq!(first, second);
    assert_eq!(first, Exit::fail("child".to_string()));
}

#[test]
fn test_children_interrupted_when_parent_ends() {
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    let child = Effect::<(), String>::never().on_interrupt(move |_| {
        let flag = flag.clone();
        Effect::sync(move || flag.store(true, Ordering::SeqCst))
    });
    let program = child.fork().zip_right(Effect::yield_now());
    assert_eq!(Runtime::default().run_sync(program), Ok(()));
    assert!(interrupted.load(Ordering::SeqCst));
}

#[test]
fn test_daemon_outlives_parent() {
    let executor = Arc::new(Executor::new());
    let scheduler: SchedulerRef = executor.clone();
    let runtime = Runtime::new().with_scheduler(scheduler);

    let daemon: Arc<Mutex<Option<Fiber<(), String>>>> = Arc::new(Mutex::new(None));
    let slot = daemon.clone();
    let program = Effect::<(), String>::never().fork_daemon().flat_map(move |fiber| {
        let slot = slot.clone();
        Effect::sync(move || *slot.lock() = Some(fiber.clone()))
    });
    let parent = runtime.run_fork(program);
    executor.run_until_idle();
    assert!(parent.is_done());

    let daemon = daemon.lock().clone().expect("daemon forked");
    assert!(!daemon.is_done());
    daemon.unsafe_interrupt();
    executor.run_until_idle();
    assert!(daemon.is_done());
}

// ============================================================================
// Fiber refs
// ============================================================================

#[test]
fn test_additive_ref_merges_children() {
    let hits = FiberRef::sum(0_i64);
    let inc = hits.update(|n| n + 1);
    let program = inc
        .clone()
        .fork()
        .zip(inc.fork())
        .flat_map(|(a, b)| a.join().zip_right(b.join()))
        .zip_right(hits.get());
    assert_eq!(Runtime::default().run_sync(program), Ok(2));
}

#[test]
fn test_additive_ref_join_order_is_irrelevant() {
    let hits = FiberRef::sum(0_i64);
    let (one, two) = (hits.update(|n| n + 1), hits.update(|n| n + 2));
    let program = one
        .fork()
        .zip(two.fork())
        .flat_map(|(a, b)| b.join().zip_right(a.join()))
        .zip_right(hits.get());
    assert_eq!(Runtime::default().run_sync(program), Ok(3));
}

#[test]
fn test_child_reset_reaches_parent() {
    let level = FiberRef::new(0_i32);
    let program = level
        .set(5)
        .zip_right(level.reset().fork())
        .flat_map(|fiber| fiber.join())
        .zip_right(level.get());
    assert_eq!(Runtime::default().run_sync(program), Ok(0));
}

#[test]
fn test_failed_child_refs_are_not_merged() {
    let value = FiberRef::new(1_i32);
    let child = value
        .set(10)
        .widen::<String>()
        .zip_right(Effect::<(), String>::fail("child".to_string()));
    let program = child
        .fork()
        .flat_map(|fiber| fiber.join().exit())
        .zip_right(value.get());
    assert_eq!(Runtime::default().run_sync(program), Ok(1));
}

#[test]
fn test_unjoined_child_changes_are_invisible() {
    let value = FiberRef::new(1_i32);
    let program = value
        .set(10)
        .fork()
        .flat_map(|fiber| fiber.await_exit())
        .zip_right(value.get());
    assert_eq!(Runtime::default().run_sync(program), Ok(1));
}

#[test]
fn test_joined_child_value_wins() {
    let value = FiberRef::new("parent".to_string());
    let child_value = value.clone();
    let program = Effect::suspend(move || child_value.set("child".to_string()))
        .fork()
        .flat_map(|fiber| fiber.join())
        .zip_right(value.get());
    assert_eq!(Runtime::default().run_sync(program), Ok("child".to_string()));
}

#[test]
fn test_locally_restores_value() {
    let value = FiberRef::new(1_i32);
    let program = value.locally(5, value.get()).zip(value.get());
    assert_eq!(Runtime::default().run_sync(program), Ok((5, 1)));

    let failing = value
        .locally(7, Effect::<i32, String>::fail("inside".to_string()))
        .catch_all(|_| Effect::<i32, String>::succeed(0))
        .zip_right(value.get().widen());
    assert_eq!(Runtime::default().run_sync(failing), Ok(1));
}

#[test]
fn test_runtime_seeds_fiber_refs() {
    let value = FiberRef::new(0_u8);
    let runtime = Runtime::new().with_fiber_ref(&value, 9);
    assert_eq!(runtime.run_sync(value.get()), Ok(9));
}

// ============================================================================
// Cooperative yielding
// ============================================================================

/// Runs tasks on an executor and counts how often fibers offer to yield.
struct CountingScheduler {
    executor: Arc<Executor>,
    yields: AtomicUsize,
}

impl Scheduler for CountingScheduler {
    fn schedule_task(&self, task: Task, priority: Priority) {
        self.executor.schedule_task(task, priority);
    }

    fn should_yield(&self, _fiber: FiberId) -> Option<Priority> {
        self.yields.fetch_add(1, Ordering::SeqCst);
        Some(Priority::Normal)
    }
}

#[test]
fn test_step_budget_yields_to_scheduler() {
    let executor = Arc::new(Executor::new());
    let counting = Arc::new(CountingScheduler {
        executor: executor.clone(),
        yields: AtomicUsize::new(0),
    });
    let scheduler: SchedulerRef = counting.clone();
    let runtime = Runtime::new()
        .with_scheduler(scheduler)
        .with_fiber_ref(current_max_ops_before_yield(), 10);

    let program = (0..1_000u32).fold(Effect::<u32, String>::succeed(0), |effect, _| {
        effect.map(|n| n + 1)
    });
    let fiber = runtime.run_fork(program);
    executor.run_until(|| fiber.is_done());

    assert_eq!(fiber.unsafe_poll(), Some(Exit::succeed(1_000)));
    assert!(counting.yields.load(Ordering::SeqCst) >= 100);
}

#[test]
fn test_yielding_disabled_by_flags() {
    let executor = Arc::new(Executor::new());
    let counting = Arc::new(CountingScheduler {
        executor: executor.clone(),
        yields: AtomicUsize::new(0),
    });
    let scheduler: SchedulerRef = counting.clone();
    let config = RuntimeConfig::builder()
        .cooperative_yielding(false)
        .build()
        .expect("valid config");
    let runtime = Runtime::new()
        .with_scheduler(scheduler)
        .with_fiber_ref(current_max_ops_before_yield(), 10)
        .with_flags(config.flags.to_flags());

    let program = (0..100u32).fold(Effect::<u32, String>::succeed(0), |effect, _| {
        effect.map(|n| n + 1)
    });
    let fiber = runtime.run_fork(program);
    executor.run_until(|| fiber.is_done());
    assert_eq!(counting.yields.load(Ordering::SeqCst), 0);
}

// ============================================================================
// Scopes and resources
// ============================================================================

#[test]
fn test_scope_closes_once() {
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();
    let scope = Scope::new();
    let program = scope
        .add_finalizer(move |_| {
            let counter = counter.clone();
            Effect::sync(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
        .zip_right(scope.close(unit_exit()))
        .zip_right(scope.close(unit_exit()))
        .zip_right(scope.close(unit_exit()));
    assert_eq!(Runtime::default().run_sync(program), Ok(()));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(scope.is_closed());
}

#[test]
fn test_finalizers_run_in_reverse_order() {
    let log = new_log();
    let (a, b, c) = (log.clone(), log.clone(), log.clone());
    let program = Effect::scoped(
        Effect::add_finalizer(move |_| push(&a, "first"))
            .zip_right(Effect::add_finalizer(move |_| push(&b, "second")))
            .zip_right(Effect::add_finalizer(move |_| push(&c, "third"))),
    );
    assert_eq!(Runtime::default().run_sync(program), Ok(()));
    assert_eq!(*log.lock(), vec!["third", "second", "first"]);
}

#[test]
fn test_finalizer_after_close_runs_immediately() {
    let log = new_log();
    let scope = Scope::new();
    let l = log.clone();
    let program = scope
        .close(unit_exit())
        .zip_right(scope.add_finalizer(move |_| push(&l, "late")));
    assert_eq!(Runtime::default().run_sync(program), Ok(()));
    assert_eq!(*log.lock(), vec!["late"]);
}

#[test]
fn test_failing_finalizers_all_run() {
    let log = new_log();
    let scope = Scope::new();
    let l = log.clone();
    let program = scope
        .add_finalizer(move |_| push(&l, "runs"))
        .zip_right(scope.add_finalizer(|_| Effect::die("first cleanup failed")))
        .zip_right(scope.close(unit_exit()));
    let exit = Runtime::default().run_sync_exit(program);
    assert!(exit.cause().map(|c| c.is_die()).unwrap_or(false));
    assert_eq!(*log.lock(), vec!["runs"]);
}

#[test]
fn test_acquire_release_lifecycle() {
    let log = new_log();
    let (l1, l2, l3) = (log.clone(), log.clone(), log.clone());
    let acquire = Effect::<i32, String>::sync(move || {
        l1.lock().push("acquire".to_string());
        7
    });
    let resource = Effect::acquire_release(acquire, move |n, _exit| push(&l2, format!("release {}", n)));
    let program = Effect::scoped(resource.flat_map(move |n| {
        let l3 = l3.clone();
        Effect::sync(move || {
            l3.lock().push("use".to_string());
            n * 2
        })
    }));
    assert_eq!(Runtime::default().run_sync(program), Ok(14));
    assert_eq!(*log.lock(), vec!["acquire", "use", "release 7"]);
}

#[test]
fn test_release_sees_failure_exit() {
    let failed = Arc::new(AtomicBool::new(false));
    let flag = failed.clone();
    let resource = Effect::acquire_release(Effect::<i32, String>::succeed(1), move |_, exit| {
        let flag = flag.clone();
        let is_failure = exit.is_failure();
        Effect::sync(move || flag.store(is_failure, Ordering::SeqCst))
    });
    let program = Effect::scoped(resource.zip_right(Effect::<i32, String>::fail("use failed".to_string())));
    let result = Runtime::default().run_sync(program);
    assert!(result.is_err());
    assert!(failed.load(Ordering::SeqCst));
}

#[test]
fn test_failed_acquire_registers_nothing() {
    let released = Arc::new(AtomicBool::new(false));
    let flag = released.clone();
    let resource = Effect::acquire_release(
        Effect::<i32, String>::fail("no resource".to_string()),
        move |_, _| {
            let flag = flag.clone();
            Effect::sync(move || flag.store(true, Ordering::SeqCst))
        },
    );
    let result = Runtime::default().run_sync(Effect::scoped(resource));
    assert!(result.is_err());
    assert!(!released.load(Ordering::SeqCst));
}

#[test]
fn test_fork_in_interrupts_on_close() {
    let interrupted = Arc::new(AtomicBool::new(false));
    let started = Arc::new(AtomicBool::new(false));
    let (flag, mark) = (interrupted.clone(), started.clone());
    let scope = Scope::new();
    let closing = scope.clone();
    let program = Effect::<(), String>::sync(move || mark.store(true, Ordering::SeqCst))
        .zip_right(Effect::<(), String>::never())
        .on_interrupt(move |_| {
            let flag = flag.clone();
            Effect::sync(move || flag.store(true, Ordering::SeqCst))
        })
        .fork_in(&scope)
        .flat_map(move |fiber| {
            let started = started.clone();
            wait_until(move || started.load(Ordering::SeqCst))
                .zip_right(closing.close(unit_exit()))
                .zip_right(fiber.await_exit())
        });
    let exit = Runtime::default().run_sync(program).expect("parent succeeds");
    assert!(exit.is_interrupted());
    assert!(interrupted.load(Ordering::SeqCst));
}

#[test]
fn test_fork_scoped_lives_until_scope_ends() {
    let log = new_log();
    let (l1, l2) = (log.clone(), log.clone());
    let background = Effect::<(), String>::never().ensuring(push(&l1, "background stopped"));
    let program = Effect::scoped(
        background
            .fork_scoped()
            .zip_right(Effect::yield_now())
            .zip_right(push(&l2, "body done")),
    );
    assert_eq!(Runtime::default().run_sync(program), Ok(()));
    assert_eq!(*log.lock(), vec!["body done", "background stopped"]);
}

#[test]
fn test_extend_into_defers_finalizers() {
    let log = new_log();
    let parent = Scope::new();
    let child = Scope::new();
    let l = log.clone();
    let observed = log.clone();
    let program = child
        .add_finalizer(move |_| push(&l, "child resource"))
        .zip_right(child.extend_into(&parent))
        .zip_right(child.close(unit_exit()))
        .zip_right(Effect::sync(move || observed.lock().len()))
        .flat_map(move |before| parent.close(unit_exit()).map(move |_| before));
    assert_eq!(Runtime::default().run_sync(program), Ok(0));
    assert_eq!(*log.lock(), vec!["child resource"]);
}

#[test]
fn test_scope_fork_closes_with_parent() {
    let log = new_log();
    let parent = Scope::new();
    let closing = parent.clone();
    let l = log.clone();
    let program = parent
        .fork()
        .flat_map(move |child| {
            let l = l.clone();
            child.add_finalizer(move |_| push(&l, "child"))
        })
        .zip_right(closing.close(unit_exit()));
    assert_eq!(Runtime::default().run_sync(program), Ok(()));
    assert_eq!(*log.lock(), vec!["child"]);
}

// ============================================================================
// Context and services
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
struct Database {
    url: String,
}

#[test]
fn test_provided_service_is_found() {
    let program = Effect::<Database, String>::service()
        .map(|db| db.url)
        .provide_service(Database {
            url: "mem://".to_string(),
        });
    assert_eq!(Runtime::default().run_sync(program), Ok("mem://".to_string()));
}

#[test]
fn test_runtime_context_reaches_effects() {
    let runtime = Runtime::new().with_service(Database {
        url: "pg://".to_string(),
    });
    let program = Effect::<Database, String>::service().map(|db| db.url);
    assert_eq!(runtime.run_sync(program), Ok("pg://".to_string()));
}

#[test]
fn test_missing_service_is_a_defect() {
    let exit = Runtime::default().run_sync_exit(Effect::<Database, String>::service());
    let cause = exit.cause().expect("lookup fails");
    assert!(cause.is_die());
    assert!(cause.defects()[0].message().contains("Database"));
}

// ============================================================================
// Supervision and logging
// ============================================================================

#[test]
fn test_lifecycle_counter_sees_every_fiber() {
    let counter = LifecycleCounter::new();
    let runtime = Runtime::new().with_supervisor(counter.clone());
    let child = Effect::<i32, String>::succeed(1);
    let program = child
        .clone()
        .fork()
        .zip(child.fork())
        .widen()
        .flat_map(|(a, b)| a.join().zip(b.join()));
    assert_eq!(runtime.run_sync(program), Ok((1, 1)));

    let counts = counter.value();
    assert_eq!(counts.started, 3);
    assert_eq!(counts.ended, 3);
    assert_eq!(counts.suspended, counts.resumed);
}

#[test]
fn test_track_lists_live_fibers() {
    let track = Track::new();
    let runtime = Runtime::new().with_supervisor(track.clone());
    let observer = track.clone();
    let program = Effect::<(), String>::never().fork().flat_map(move |fiber| {
        let observer = observer.clone();
        Effect::sync(move || observer.value().len()).zip_left(fiber.interrupt())
    });
    assert_eq!(runtime.run_sync(program), Ok(2));
    assert!(track.value().is_empty());
}

#[test]
fn test_supervised_observes_forked_fibers() {
    let counter = LifecycleCounter::new();
    let forks = Effect::<(), String>::succeed(())
        .fork()
        .widen()
        .flat_map(|fiber| fiber.join());
    let program = Effect::supervised(counter.clone(), forks);
    assert_eq!(Runtime::default().run_sync(program), Ok(()));
    assert_eq!(counter.value().started, 1);
}

struct PanickingHooks;

impl Supervisor for PanickingHooks {
    type Value = ();

    fn value(&self) {}

    fn on_start(&self, _fiber: &strand_runtime::RuntimeFiber, _parent: Option<FiberId>) {
        panic!("start hook failed");
    }
}

#[test]
fn test_zipped_supervisor_survives_panicking_neighbour() {
    let counter = LifecycleCounter::new();
    let forks = Effect::<(), String>::succeed(())
        .fork()
        .widen()
        .flat_map(|fiber| fiber.join());
    let program = Effect::supervised(PanickingHooks.zip(counter.clone()), forks);
    assert_eq!(Runtime::default().run_sync(program), Ok(()));
    assert_eq!(counter.value().started, 1);
    assert_eq!(counter.value().ended, 1);
}

#[test]
fn test_annotate_logs_is_scoped() {
    let inside = Effect::annotate_logs(
        "request",
        "42",
        Effect::log("handling").zip_right(current_log_annotations().get()),
    );
    let program = inside.zip(current_log_annotations().get());
    let (annotated, after): (HashMap<String, String>, HashMap<String, String>) =
        Runtime::default().run_sync(program).expect("logging never fails");
    assert_eq!(annotated.get("request").map(String::as_str), Some("42"));
    assert!(after.is_empty());
}

// ============================================================================
// Worker pool
// ============================================================================

#[test]
fn test_worker_pool_runs_forked_fibers() {
    let config = RuntimeConfig::builder().num_workers(2).build().expect("valid config");
    let runtime = Runtime::from_config(&config);
    let program = (0..8)
        .map(|i| Effect::<i32, Infallible>::succeed(i).fork())
        .fold(Effect::succeed(0), |acc: Effect<i32>, fork| {
            acc.flat_map(move |sum| fork.clone().flat_map(|fiber| fiber.join()).map(move |n| sum + n))
        });
    let fiber = runtime.run_fork(program);

    let deadline = Instant::now() + Duration::from_secs(10);
    while !fiber.is_done() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(fiber.unsafe_poll(), Some(Exit::succeed(28)));
}
