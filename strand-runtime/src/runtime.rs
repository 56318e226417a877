//! # Runtime
//!
//! A [`Runtime`] bundles the context, fiber refs and runtime flags that root
//! fibers start with, and runs effects.
//!
//! ## Run adapters
//!
//! - `run_fork`: start a root fiber on the configured scheduler and return its
//!   handle right away
//! - `run_sync` / `run_sync_exit`: drive a private [`Executor`] on the calling
//!   thread until it is idle; an effect that is still suspended afterwards
//!   reports an async boundary
//! - `run_blocking` / `run_blocking_exit`: drive a private [`Executor`] on the
//!   calling thread until the fiber is done, waiting for callbacks resumed from
//!   other threads
//!
//! ## Example
//!
//! ```rust,ignore
//! use strand_runtime::{Effect, Runtime};
//!
//! let runtime = Runtime::default();
//! let answer = runtime.run_sync(Effect::<i32, String>::succeed(41).map(|n| n + 1));
//! assert_eq!(answer, Ok(42));
//! ```

use std::fmt;
use std::sync::Arc;

use crate::cause::Defect;
use crate::config::RuntimeConfig;
use crate::context::Context;
use crate::effect::Effect;
use crate::error::RunError;
use crate::exit::Exit;
use crate::fiber::{next_fiber_id, Fiber, RuntimeFiber, RuntimeFlags};
use crate::fiber_ref::{
    current_context, current_log_level, current_max_ops_before_yield, current_scheduler,
    current_supervisor, FiberRef, FiberRefs,
};
use crate::fiber_runtime::FiberRuntime;
use crate::scheduler::{Executor, SchedulerRef, WorkerPool};
use crate::supervisor::{Supervisor, SupervisorRef};
use crate::value::Value;

/// Everything root fibers are seeded with.
#[derive(Clone, Default)]
pub struct Runtime {
    context: Context,
    fiber_refs: FiberRefs,
    flags: RuntimeFlags,
}

impl Runtime {
    /// A runtime with an empty context, default fiber refs and default flags.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a runtime from configuration, with its own worker pool.
    pub fn from_config(config: &RuntimeConfig) -> Self {
        let pool: SchedulerRef = Arc::new(WorkerPool::new(config.scheduler.num_workers));
        tracing::debug!(
            num_workers = config.scheduler.num_workers,
            max_ops_before_yield = config.scheduler.max_ops_before_yield,
            log_level = %config.log.level,
            "runtime configured"
        );
        Self::new()
            .with_scheduler(pool)
            .with_fiber_ref(current_max_ops_before_yield(), config.scheduler.max_ops_before_yield)
            .with_fiber_ref(current_log_level(), config.log.level)
            .with_flags(config.flags.to_flags())
    }

    /// Replace the context.
    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    /// Add a service to the context.
    pub fn with_service<S: Value>(mut self, service: S) -> Self {
        self.context.insert(service);
        self
    }

    /// Replace the whole fiber ref store.
    pub fn with_fiber_refs(mut self, fiber_refs: FiberRefs) -> Self {
        self.fiber_refs = fiber_refs;
        self
    }

    /// Seed one fiber ref.
    pub fn with_fiber_ref<V: Value>(mut self, fiber_ref: &FiberRef<V>, value: V) -> Self {
        self.fiber_refs.set(fiber_ref, value);
        self
    }

    /// Replace the runtime flags.
    pub fn with_flags(mut self, flags: RuntimeFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Run root fibers on `scheduler`.
    pub fn with_scheduler(self, scheduler: SchedulerRef) -> Self {
        self.with_fiber_ref(current_scheduler(), scheduler)
    }

    /// Add a supervisor observing every fiber.
    pub fn with_supervisor<S: Supervisor>(self, supervisor: S) -> Self {
        let combined = self
            .fiber_refs
            .get(current_supervisor())
            .combine(&SupervisorRef::new(supervisor));
        self.with_fiber_ref(current_supervisor(), combined)
    }

    /// The context root fibers start with.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// The fiber refs root fibers start with.
    pub fn fiber_refs(&self) -> &FiberRefs {
        &self.fiber_refs
    }

    /// The runtime flags root fibers start with.
    pub fn flags(&self) -> RuntimeFlags {
        self.flags
    }

    fn fork_on<A: Value, E: Value>(
        &self,
        effect: Effect<A, E>,
        scheduler: Option<SchedulerRef>,
    ) -> Fiber<A, E> {
        let mut refs = self.fiber_refs.clone();
        if !self.context.is_empty() {
            let context = refs.get(current_context()).merge(&self.context);
            refs.set(current_context(), context);
        }
        let scheduler = scheduler.unwrap_or_else(|| {
            let configured = refs.scheduler();
            configured.assign_root().unwrap_or(configured)
        });
        refs.set(current_scheduler(), scheduler);

        let fiber = RuntimeFiber(FiberRuntime::new(next_fiber_id(), refs.clone(), self.flags));
        refs.get(current_supervisor()).notify_start(&fiber, None);
        tracing::trace!(fiber = %fiber.id(), "root fiber forked");
        fiber.0.start(effect.node);
        Fiber::new(fiber)
    }

    /// Start `effect` on a new root fiber.
    pub fn run_fork<A: Value, E: Value>(&self, effect: Effect<A, E>) -> Fiber<A, E> {
        self.fork_on(effect, None)
    }

    /// Run `effect` on the calling thread until no work is left.
    ///
    /// If the fiber is still suspended afterwards, the exit is a defect
    /// describing the async boundary. Prefer [`run_sync`](Self::run_sync),
    /// which reports that case as [`RunError::AsyncBoundary`].
    pub fn run_sync_exit<A: Value, E: Value>(&self, effect: Effect<A, E>) -> Exit<A, E> {
        let (fiber, exit) = self.drive_until_idle(effect);
        exit.unwrap_or_else(|| {
            Exit::die(Defect::new(format!(
                "fiber {} is suspended at an async boundary",
                fiber.id()
            )))
        })
    }

    /// Run `effect` on the calling thread until no work is left, returning
    /// its value.
    pub fn run_sync<A: Value, E: Value + fmt::Debug>(
        &self,
        effect: Effect<A, E>,
    ) -> Result<A, RunError<E>> {
        let (fiber, exit) = self.drive_until_idle(effect);
        match exit {
            Some(exit) => into_run_result(&fiber, exit),
            None => Err(RunError::AsyncBoundary(fiber.id())),
        }
    }

    fn drive_until_idle<A: Value, E: Value>(
        &self,
        effect: Effect<A, E>,
    ) -> (Fiber<A, E>, Option<Exit<A, E>>) {
        let executor = Arc::new(Executor::new());
        let scheduler: SchedulerRef = executor.clone();
        let fiber = self.fork_on(effect, Some(scheduler));
        executor.run_until_idle();
        let exit = fiber.unsafe_poll();
        (fiber, exit)
    }

    /// Run `effect`, blocking the calling thread until it finishes.
    pub fn run_blocking_exit<A: Value, E: Value>(&self, effect: Effect<A, E>) -> Exit<A, E> {
        let executor = Arc::new(Executor::new());
        let scheduler: SchedulerRef = executor.clone();
        let fiber = self.fork_on(effect, Some(scheduler));
        executor.run_until(|| fiber.is_done());
        match fiber.unsafe_poll() {
            Some(exit) => exit,
            None => Exit::die(Defect::new(format!("fiber {} did not finish", fiber.id()))),
        }
    }

    /// Run `effect`, blocking the calling thread until it finishes, and
    /// return its value.
    pub fn run_blocking<A: Value, E: Value + fmt::Debug>(
        &self,
        effect: Effect<A, E>,
    ) -> Result<A, RunError<E>> {
        let executor = Arc::new(Executor::new());
        let scheduler: SchedulerRef = executor.clone();
        let fiber = self.fork_on(effect, Some(scheduler));
        executor.run_until(|| fiber.is_done());
        match fiber.unsafe_poll() {
            Some(exit) => into_run_result(&fiber, exit),
            None => Err(RunError::AsyncBoundary(fiber.id())),
        }
    }
}

fn into_run_result<A: Value, E: Value + fmt::Debug>(
    fiber: &Fiber<A, E>,
    exit: Exit<A, E>,
) -> Result<A, RunError<E>> {
    exit.into_result()
        .map_err(|cause| RunError::from_cause(fiber.id(), cause))
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("context", &self.context)
            .field("fiber_refs", &self.fiber_refs)
            .field("flags", &self.flags)
            .finish()
    }
}
