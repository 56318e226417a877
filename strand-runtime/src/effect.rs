//! # Effect Programs
//!
//! An [`Effect<A, E>`] is an immutable description of a computation that
//! succeeds with an `A`, fails with an `E`, dies with a defect, or is
//! interrupted. Nothing runs until a [`Runtime`](crate::Runtime) interprets it,
//! and the same effect can be run any number of times.
//!
//! ## Design
//!
//! - Every effect is a tree of [`Node`]s, a single closed tagged union reduced
//!   by one flat loop in [`FiberRuntime`](crate::fiber_runtime::FiberRuntime).
//! - Nodes are shared behind `Arc`, so cloning an effect is cheap.
//! - Values are type-erased inside the tree ([`AnyValue`]); the typed API
//!   erases on the way in and downcasts on the way out.
//! - Dropping a deep chain is iterative.
//!
//! ## Example
//!
//! ```rust,ignore
//! use strand_runtime::{Effect, Runtime};
//!
//! let program = Effect::<i32, String>::succeed(1)
//!     .flat_map(|n| Effect::succeed(n + 1))
//!     .catch_all(|e: String| Effect::succeed(e.len() as i32));
//! assert_eq!(Runtime::default().run_sync(program), Ok(2));
//! ```

use std::collections::HashSet;
use std::convert::Infallible;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};

use crate::cause::{Cause, Defect};
use crate::context::Context;
use crate::exit::Exit;
use crate::fiber::{Fiber, FiberId, Priority, RuntimeFiber};
use crate::fiber_ref::{
    current_context, current_log_annotations, current_log_level, current_supervisor,
    ErasedFiberRef,
};
use crate::fiber_runtime::{FiberRuntime, FiberState, ResumeHandle};
use crate::log::{self, LogLevel};
use crate::scope::Scope;
use crate::supervisor::{Supervisor, SupervisorRef};
use crate::value::{
    erase, erase_cause, erase_exit, type_mismatch, unerase, unerase_cause, unerase_exit,
    AnyValue, ErasedExit, Value,
};

// ============================================================================
// Nodes
// ============================================================================

pub(crate) type Cont = Arc<dyn Fn(AnyValue) -> Arc<Node> + Send + Sync>;
pub(crate) type CauseHandler = Arc<dyn Fn(Cause<AnyValue>) -> Arc<Node> + Send + Sync>;
pub(crate) type Register = Arc<dyn Fn(ResumeHandle) -> Option<Arc<Node>> + Send + Sync>;
pub(crate) type Release = Arc<dyn Fn(AnyValue, &ErasedExit) -> Arc<Node> + Send + Sync>;
pub(crate) type FiberAccess =
    Arc<dyn Fn(&Arc<FiberRuntime>, &mut FiberState) -> Arc<Node> + Send + Sync>;

/// A primitive operation of an effect program.
pub(crate) enum Node {
    /// Succeed with a value.
    Succeed(AnyValue),
    /// Fail with the cause produced by the thunk.
    Fail(Arc<dyn Fn() -> Cause<AnyValue> + Send + Sync>),
    /// Run a side-effecting thunk.
    Sync(Arc<dyn Fn() -> AnyValue + Send + Sync>),
    /// Suspend until the registered callback is invoked.
    Async {
        register: Register,
        blocking_on: Option<FiberId>,
    },
    /// Run the effect, then feed its value to the continuation.
    FlatMap(Arc<Node>, Cont),
    /// Run the effect and handle both outcomes.
    Fold {
        effect: Arc<Node>,
        on_failure: CauseHandler,
        on_success: Cont,
    },
    /// Start the effect on a new fiber.
    Fork { effect: Arc<Node>, daemon: bool },
    /// Run the effect with a different context.
    Provide(Context, Arc<Node>),
    /// Run the effect with a fiber ref set to a value.
    Locally {
        fiber_ref: Arc<dyn ErasedFiberRef>,
        value: AnyValue,
        effect: Arc<Node>,
    },
    /// Acquire uninterruptibly and register the release on the current scope.
    AcquireRelease { acquire: Arc<Node>, release: Release },
    /// Run the effect with interruption enabled or disabled.
    SetInterruptible(bool, Arc<Node>),
    /// Give the thread back to the scheduler.
    Yield(Priority),
    /// Inspect or update the running fiber.
    WithFiber(FiberAccess),
}

/// Leaf swapped into parent slots while dropping a chain.
fn placeholder() -> &'static Arc<Node> {
    static PLACEHOLDER: OnceLock<Arc<Node>> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| Arc::new(Node::Yield(Priority::Normal)))
}

/// The erased `()`.
pub(crate) fn unit_value() -> AnyValue {
    static UNIT: OnceLock<AnyValue> = OnceLock::new();
    UNIT.get_or_init(|| erase(())).clone()
}

impl Node {
    /// Move the direct child node, if any, into `out`.
    fn take_children(&mut self, out: &mut Vec<Arc<Node>>) {
        let slot = match self {
            Node::FlatMap(effect, _)
            | Node::Fold { effect, .. }
            | Node::Fork { effect, .. }
            | Node::Provide(_, effect)
            | Node::Locally { effect, .. }
            | Node::AcquireRelease {
                acquire: effect, ..
            }
            | Node::SetInterruptible(_, effect) => effect,
            _ => return,
        };
        let placeholder = placeholder();
        if !Arc::ptr_eq(slot, placeholder) {
            out.push(std::mem::replace(slot, placeholder.clone()));
        }
    }

    fn tag(&self) -> &'static str {
        match self {
            Node::Succeed(_) => "Succeed",
            Node::Fail(_) => "Fail",
            Node::Sync(_) => "Sync",
            Node::Async { .. } => "Async",
            Node::FlatMap(..) => "FlatMap",
            Node::Fold { .. } => "Fold",
            Node::Fork { .. } => "Fork",
            Node::Provide(..) => "Provide",
            Node::Locally { .. } => "Locally",
            Node::AcquireRelease { .. } => "AcquireRelease",
            Node::SetInterruptible(..) => "SetInterruptible",
            Node::Yield(_) => "Yield",
            Node::WithFiber(_) => "WithFiber",
        }
    }

    pub(crate) fn succeed(value: AnyValue) -> Arc<Node> {
        Arc::new(Node::Succeed(value))
    }

    pub(crate) fn unit() -> Arc<Node> {
        Node::succeed(unit_value())
    }

    pub(crate) fn fail_cause(cause: Cause<AnyValue>) -> Arc<Node> {
        Arc::new(Node::Fail(Arc::new(move || cause.clone())))
    }

    pub(crate) fn die(defect: Defect) -> Arc<Node> {
        Node::fail_cause(Cause::Die(defect))
    }

    pub(crate) fn from_exit(exit: &ErasedExit) -> Arc<Node> {
        match exit {
            Exit::Success(v) => Node::succeed(v.clone()),
            Exit::Failure(cause) => Node::fail_cause(cause.clone()),
        }
    }

    pub(crate) fn sync(f: impl Fn() -> AnyValue + Send + Sync + 'static) -> Arc<Node> {
        Arc::new(Node::Sync(Arc::new(f)))
    }

    /// Build the node lazily, when it is reached.
    pub(crate) fn suspend(f: impl Fn() -> Arc<Node> + Send + Sync + 'static) -> Arc<Node> {
        Node::flat_map(Node::unit(), move |_| f())
    }

    pub(crate) fn flat_map(
        effect: Arc<Node>,
        k: impl Fn(AnyValue) -> Arc<Node> + Send + Sync + 'static,
    ) -> Arc<Node> {
        Arc::new(Node::FlatMap(effect, Arc::new(k)))
    }

    pub(crate) fn zip_right(first: Arc<Node>, second: Arc<Node>) -> Arc<Node> {
        Node::flat_map(first, move |_| second.clone())
    }

    pub(crate) fn fold(
        effect: Arc<Node>,
        on_failure: impl Fn(Cause<AnyValue>) -> Arc<Node> + Send + Sync + 'static,
        on_success: impl Fn(AnyValue) -> Arc<Node> + Send + Sync + 'static,
    ) -> Arc<Node> {
        Arc::new(Node::Fold {
            effect,
            on_failure: Arc::new(on_failure),
            on_success: Arc::new(on_success),
        })
    }

    /// Handle failures only.
    pub(crate) fn catch_cause(
        effect: Arc<Node>,
        on_failure: impl Fn(Cause<AnyValue>) -> Arc<Node> + Send + Sync + 'static,
    ) -> Arc<Node> {
        Node::fold(effect, on_failure, Node::succeed)
    }

    pub(crate) fn async_(register: Register, blocking_on: Option<FiberId>) -> Arc<Node> {
        Arc::new(Node::Async {
            register,
            blocking_on,
        })
    }

    pub(crate) fn with_fiber(
        f: impl Fn(&Arc<FiberRuntime>, &mut FiberState) -> Arc<Node> + Send + Sync + 'static,
    ) -> Arc<Node> {
        Arc::new(Node::WithFiber(Arc::new(f)))
    }

    pub(crate) fn set_interruptible(interruptible: bool, effect: Arc<Node>) -> Arc<Node> {
        Arc::new(Node::SetInterruptible(interruptible, effect))
    }

    /// Run `f` uninterruptibly, passing the interruptibility to restore inside.
    pub(crate) fn uninterruptible_mask(
        f: impl Fn(bool) -> Arc<Node> + Send + Sync + 'static,
    ) -> Arc<Node> {
        Node::with_fiber(move |_, state| {
            let restore = state.interruption_enabled();
            Node::set_interruptible(false, f(restore))
        })
    }

    pub(crate) fn locally(
        fiber_ref: Arc<dyn ErasedFiberRef>,
        value: AnyValue,
        effect: Arc<Node>,
    ) -> Arc<Node> {
        Arc::new(Node::Locally {
            fiber_ref,
            value,
            effect,
        })
    }

    /// Run `cleanup`, then complete with `exit`. A failing cleanup is appended
    /// to the exit's cause.
    pub(crate) fn then_exit(cleanup: Arc<Node>, exit: ErasedExit) -> Arc<Node> {
        let on_success_exit = exit.clone();
        Node::fold(
            cleanup,
            move |cause| Node::from_exit(&exit.clone().then_cause(cause)),
            move |_| Node::from_exit(&on_success_exit),
        )
    }

    /// Run `effect` with `service` added to the current context.
    pub(crate) fn provide_service(service: AnyValue, name: &'static str, effect: Arc<Node>) -> Arc<Node> {
        Node::with_fiber(move |_, state| {
            let mut context = state.refs.get(current_context());
            context.insert_erased(service.clone(), name);
            Arc::new(Node::Provide(context, effect.clone()))
        })
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        let mut pending = Vec::new();
        self.take_children(&mut pending);
        while let Some(mut child) = pending.pop() {
            if let Some(node) = Arc::get_mut(&mut child) {
                node.take_children(&mut pending);
            }
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Downcast the incoming value before calling a typed continuation.
fn typed_cont<A: Value>(
    f: impl Fn(A) -> Arc<Node> + Send + Sync + 'static,
) -> impl Fn(AnyValue) -> Arc<Node> + Send + Sync + 'static {
    move |value| match unerase::<A>(&value) {
        Some(a) => f(a),
        None => Node::die(type_mismatch::<A>()),
    }
}

// ============================================================================
// Effect
// ============================================================================

/// A lazy, re-runnable description of a computation.
///
/// `A` is the success type and `E` the typed failure. Effects that cannot
/// fail use the default `E = Infallible`; lift them with
/// [`widen`](Effect::widen) to combine them with fallible ones.
pub struct Effect<A, E = Infallible> {
    pub(crate) node: Arc<Node>,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for Effect<A, E> {
    fn clone(&self) -> Self {
        Self {
            node: Arc::clone(&self.node),
            _marker: PhantomData,
        }
    }
}

impl<A, E> fmt::Debug for Effect<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Effect").field(&self.node).finish()
    }
}

impl<A, E> Effect<A, E> {
    pub(crate) fn from_node(node: Arc<Node>) -> Self {
        Self {
            node,
            _marker: PhantomData,
        }
    }
}

/// Single-use callback resuming a fiber suspended by [`Effect::async_`].
///
/// Only the first call has any effect; later calls are ignored.
pub struct Resume<A, E> {
    handle: ResumeHandle,
    _marker: PhantomData<fn(A, E)>,
}

impl<A, E> Clone for Resume<A, E> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A: Value, E: Value> Resume<A, E> {
    /// Resume with a value.
    pub fn succeed(&self, value: A) {
        self.handle.resume(Node::succeed(erase(value)));
    }

    /// Resume with a typed failure.
    pub fn fail(&self, error: E) {
        self.handle.resume(Node::fail_cause(Cause::Fail(erase(error))));
    }

    /// Resume with an exit.
    pub fn complete(&self, exit: Exit<A, E>) {
        self.handle.resume(Node::from_exit(&erase_exit(exit)));
    }

    /// Resume by running `effect` on the suspended fiber.
    pub fn resume(&self, effect: Effect<A, E>) {
        self.handle.resume(effect.node);
    }

    /// Check if this callback (or a clone of it) has already fired.
    pub fn is_fired(&self) -> bool {
        self.handle.is_fired()
    }
}

/// Restores the interruptibility in effect outside an
/// [`uninterruptible_mask`](Effect::uninterruptible_mask).
#[derive(Debug, Clone, Copy)]
pub struct Restore {
    interruptible: bool,
}

impl Restore {
    /// Run `effect` with the outer interruptibility.
    pub fn apply<A: Value, E: Value>(&self, effect: Effect<A, E>) -> Effect<A, E> {
        Effect::from_node(Node::set_interruptible(self.interruptible, effect.node))
    }
}

impl<A: Value, E: Value> Effect<A, E> {
    // ------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------

    /// Succeed with `value`.
    pub fn succeed(value: A) -> Self {
        Self::from_node(Node::succeed(erase(value)))
    }

    /// Fail with a typed error.
    pub fn fail(error: E) -> Self {
        Self::fail_cause(Cause::Fail(error))
    }

    /// Fail with a full cause.
    pub fn fail_cause(cause: Cause<E>) -> Self {
        Self::from_node(Node::fail_cause(erase_cause(cause)))
    }

    /// Die with a defect.
    pub fn die(message: impl Into<String>) -> Self {
        Self::from_node(Node::die(Defect::new(message)))
    }

    /// Complete with `exit`.
    pub fn from_exit(exit: Exit<A, E>) -> Self {
        Self::from_node(Node::from_exit(&erase_exit(exit)))
    }

    /// Succeed or fail with `result`.
    pub fn from_result(result: Result<A, E>) -> Self {
        Self::from_exit(result.into())
    }

    /// Run a side effect. A panic becomes a defect.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn() -> A + Send + Sync + 'static,
    {
        Self::from_node(Node::sync(move || erase(f())))
    }

    /// Run a fallible side effect. A panic becomes a defect.
    pub fn try_sync<F>(f: F) -> Self
    where
        F: Fn() -> Result<A, E> + Send + Sync + 'static,
    {
        Self::from_node(Node::flat_map(
            Node::sync(move || erase(f())),
            typed_cont(|result: Result<A, E>| match result {
                Ok(a) => Node::succeed(erase(a)),
                Err(e) => Node::fail_cause(Cause::Fail(erase(e))),
            }),
        ))
    }

    /// Build the effect lazily, each time it runs.
    pub fn suspend<F>(f: F) -> Self
    where
        F: Fn() -> Effect<A, E> + Send + Sync + 'static,
    {
        Self::from_node(Node::suspend(move || f().node))
    }

    /// Suspend the fiber until `register`'s callback is invoked.
    pub fn async_<F>(register: F) -> Self
    where
        F: Fn(Resume<A, E>) + Send + Sync + 'static,
    {
        Self::async_interrupt(move |resume| {
            register(resume);
            None
        })
    }

    /// Suspend the fiber until `register`'s callback is invoked. The returned
    /// canceler, if any, runs uninterruptibly when the fiber is interrupted
    /// while suspended.
    pub fn async_interrupt<F>(register: F) -> Self
    where
        F: Fn(Resume<A, E>) -> Option<Effect<()>> + Send + Sync + 'static,
    {
        let register = Arc::new(move |handle: ResumeHandle| {
            register(Resume {
                handle,
                _marker: PhantomData,
            })
            .map(|canceler| canceler.node)
        });
        Self::from_node(Node::async_(register, None))
    }

    /// An effect that never completes unless interrupted.
    pub fn never() -> Self {
        Self::async_(|_| {})
    }

    /// Interrupt the current fiber.
    pub fn interrupt() -> Self {
        Self::from_node(Node::with_fiber(|fiber, _| {
            Node::fail_cause(Cause::Interrupt(fiber.id()))
        }))
    }

    /// Look up a service in the context. A missing service is a defect.
    pub fn service() -> Self {
        Self::from_node(Node::with_fiber(|_, state| {
            match state.refs.get(current_context()).get::<A>() {
                Some(service) => Node::succeed(erase(service)),
                None => Node::die(Defect::new(format!(
                    "service `{}` not found in context",
                    std::any::type_name::<A>()
                ))),
            }
        }))
    }

    /// Acquire a resource uninterruptibly and register `release` on the
    /// current scope, only if acquisition succeeds.
    pub fn acquire_release<R>(acquire: Effect<A, E>, release: R) -> Self
    where
        R: Fn(A, &ErasedExit) -> Effect<()> + Send + Sync + 'static,
    {
        let release: Release = Arc::new(move |value, exit| match unerase::<A>(&value) {
            Some(a) => release(a, exit).node,
            None => Node::die(type_mismatch::<A>()),
        });
        Self::from_node(Arc::new(Node::AcquireRelease {
            acquire: acquire.node,
            release,
        }))
    }

    /// Run `effect` in a fresh scope, closed with the effect's exit on every
    /// exit path.
    pub fn scoped(effect: Effect<A, E>) -> Self {
        let node = effect.node;
        Self::from_node(Node::uninterruptible_mask(move |restore| {
            let scope = Scope::new();
            let inner = Node::set_interruptible(
                restore,
                Node::provide_service(erase(scope.clone()), std::any::type_name::<Scope>(), node.clone()),
            );
            let on_failure_scope = scope.clone();
            Node::fold(
                inner,
                move |cause| {
                    let exit = Exit::Failure(cause);
                    Node::then_exit(on_failure_scope.close(exit.clone()).node, exit)
                },
                move |value| {
                    let exit = Exit::Success(value);
                    Node::then_exit(scope.close(exit.clone()).node, exit)
                },
            )
        }))
    }

    /// Run `f` uninterruptibly. The [`Restore`] handed to `f` re-enables the
    /// outer interruptibility for the parts that may be interrupted.
    pub fn uninterruptible_mask<F>(f: F) -> Self
    where
        F: Fn(Restore) -> Effect<A, E> + Send + Sync + 'static,
    {
        Self::from_node(Node::uninterruptible_mask(move |interruptible| {
            f(Restore { interruptible }).node
        }))
    }

    /// Run `effect` with `key = value` attached to its log events.
    pub fn annotate_logs(
        key: impl Into<String>,
        value: impl Into<String>,
        effect: Effect<A, E>,
    ) -> Self {
        let (key, value) = (key.into(), value.into());
        current_log_annotations().locally_with(
            move |mut annotations| {
                annotations.insert(key.clone(), value.clone());
                annotations
            },
            effect,
        )
    }

    /// Run `effect` with `supervisor` observing the fibers forked inside it.
    pub fn supervised<S: Supervisor>(supervisor: S, effect: Effect<A, E>) -> Self {
        let added = SupervisorRef::new(supervisor);
        current_supervisor().locally_with(move |current| current.combine(&added), effect)
    }

    // ------------------------------------------------------------------
    // Sequencing
    // ------------------------------------------------------------------

    /// Transform the success value.
    pub fn map<B, F>(self, f: F) -> Effect<B, E>
    where
        B: Value,
        F: Fn(A) -> B + Send + Sync + 'static,
    {
        Effect::from_node(Node::flat_map(
            self.node,
            typed_cont(move |a: A| Node::succeed(erase(f(a)))),
        ))
    }

    /// Continue with the effect computed from the success value.
    pub fn flat_map<B, F>(self, f: F) -> Effect<B, E>
    where
        B: Value,
        F: Fn(A) -> Effect<B, E> + Send + Sync + 'static,
    {
        Effect::from_node(Node::flat_map(self.node, typed_cont(move |a: A| f(a).node)))
    }

    /// Run `that` after this effect, keeping its value.
    pub fn zip_right<B: Value>(self, that: Effect<B, E>) -> Effect<B, E> {
        Effect::from_node(Node::zip_right(self.node, that.node))
    }

    /// Run `that` after this effect, keeping this effect's value.
    pub fn zip_left<B: Value>(self, that: Effect<B, E>) -> Effect<A, E> {
        let that = that.node;
        Effect::from_node(Node::flat_map(self.node, move |value| {
            Node::zip_right(that.clone(), Node::succeed(value))
        }))
    }

    /// Run both effects in sequence and pair their values.
    pub fn zip<B: Value>(self, that: Effect<B, E>) -> Effect<(A, B), E> {
        self.flat_map(move |a| that.clone().map(move |b| (a.clone(), b)))
    }

    /// Discard the success value.
    pub fn as_unit(self) -> Effect<(), E> {
        Effect::from_node(Node::zip_right(self.node, Node::unit()))
    }

    // ------------------------------------------------------------------
    // Error handling
    // ------------------------------------------------------------------

    /// Transform the typed failures.
    pub fn map_error<E2, F>(self, f: F) -> Effect<A, E2>
    where
        E2: Value,
        F: Fn(E) -> E2 + Send + Sync + 'static,
    {
        Effect::from_node(Node::catch_cause(self.node, move |cause| {
            Node::fail_cause(cause.flat_map_failures(|e| match unerase::<E>(e) {
                Some(e) => Cause::Fail(erase(f(e))),
                None => Cause::Die(type_mismatch::<E>()),
            }))
        }))
    }

    /// Recover from a typed failure. Defects and interruptions pass through.
    pub fn catch_all<E2, F>(self, f: F) -> Effect<A, E2>
    where
        E2: Value,
        F: Fn(E) -> Effect<A, E2> + Send + Sync + 'static,
    {
        Effect::from_node(Node::catch_cause(self.node, move |cause| {
            match cause.first_failure() {
                Some(error) => match unerase::<E>(error) {
                    Some(e) => f(e).node,
                    None => Node::die(type_mismatch::<E>()),
                },
                None => Node::fail_cause(cause),
            }
        }))
    }

    /// Recover from any failure, seeing the full cause.
    pub fn catch_all_cause<E2, F>(self, f: F) -> Effect<A, E2>
    where
        E2: Value,
        F: Fn(Cause<E>) -> Effect<A, E2> + Send + Sync + 'static,
    {
        Effect::from_node(Node::catch_cause(self.node, move |cause| {
            f(unerase_cause::<E>(&cause)).node
        }))
    }

    /// Expose the full cause as the typed failure.
    pub fn sandbox(self) -> Effect<A, Cause<E>> {
        Effect::from_node(Node::catch_cause(self.node, |cause| {
            Node::fail_cause(Cause::Fail(erase(unerase_cause::<E>(&cause))))
        }))
    }

    /// Succeed with the exit of this effect.
    pub fn exit(self) -> Effect<Exit<A, E>> {
        Effect::from_node(Node::fold(
            self.node,
            |cause| Node::succeed(erase(Exit::<A, E>::Failure(unerase_cause(&cause)))),
            |value| Node::succeed(erase(unerase_exit::<A, E>(&Exit::Success(value)))),
        ))
    }

    /// Run `finalizer` after this effect, whatever its outcome.
    pub fn ensuring(self, finalizer: Effect<()>) -> Self {
        self.on_exit(move |_| finalizer.clone())
    }

    /// Run `cleanup` with this effect's exit, whatever the outcome. The cleanup
    /// runs uninterruptibly; its failure is appended to the exit's cause.
    pub fn on_exit<F>(self, cleanup: F) -> Self
    where
        F: Fn(&Exit<A, E>) -> Effect<()> + Send + Sync + 'static,
    {
        let cleanup = Arc::new(cleanup);
        let node = self.node;
        Self::from_node(Node::uninterruptible_mask(move |restore| {
            let on_failure = cleanup.clone();
            let on_success = cleanup.clone();
            Node::fold(
                Node::set_interruptible(restore, node.clone()),
                move |cause| {
                    let exit: ErasedExit = Exit::Failure(cause);
                    let finalizer = on_failure(&unerase_exit::<A, E>(&exit)).node;
                    Node::then_exit(finalizer, exit)
                },
                move |value| {
                    let exit: ErasedExit = Exit::Success(value);
                    let finalizer = on_success(&unerase_exit::<A, E>(&exit)).node;
                    Node::then_exit(finalizer, exit)
                },
            )
        }))
    }

    /// Run `cleanup` with the interrupting fibers if this effect is
    /// interrupted.
    pub fn on_interrupt<F>(self, cleanup: F) -> Self
    where
        F: Fn(HashSet<FiberId>) -> Effect<()> + Send + Sync + 'static,
    {
        self.on_exit(move |exit| match exit {
            Exit::Failure(cause) if cause.is_interrupted() => cleanup(cause.interruptors()),
            _ => Effect::unit(),
        })
    }

    // ------------------------------------------------------------------
    // Concurrency
    // ------------------------------------------------------------------

    fn fork_with(self, daemon: bool) -> Effect<Fiber<A, E>> {
        let fork = Arc::new(Node::Fork {
            effect: self.node,
            daemon,
        });
        Effect::from_node(Node::flat_map(
            fork,
            typed_cont(|fiber: RuntimeFiber| Node::succeed(erase(Fiber::<A, E>::new(fiber)))),
        ))
    }

    /// Start this effect on a child fiber. The child is interrupted when the
    /// parent finishes.
    pub fn fork(self) -> Effect<Fiber<A, E>> {
        self.fork_with(false)
    }

    /// Start this effect on a fiber that is not tied to the current one.
    pub fn fork_daemon(self) -> Effect<Fiber<A, E>> {
        self.fork_with(true)
    }

    /// Start this effect on a daemon fiber that is interrupted when `scope`
    /// closes.
    pub fn fork_in(self, scope: &Scope) -> Effect<Fiber<A, E>> {
        let scope = scope.clone();
        Effect::uninterruptible_mask(move |restore| {
            let scope = scope.clone();
            restore.apply(self.clone()).fork_daemon().flat_map(move |fiber| {
                let handle = fiber.clone();
                scope
                    .add_finalizer(move |_| handle.interrupt().as_unit())
                    .map(move |_| fiber.clone())
            })
        })
    }

    /// Start this effect on a daemon fiber tied to the current scope.
    pub fn fork_scoped(self) -> Effect<Fiber<A, E>> {
        Effect::scope().flat_map(move |scope| self.clone().fork_in(&scope))
    }

    /// Enable interruption for this effect.
    pub fn interruptible(self) -> Self {
        Self::from_node(Node::set_interruptible(true, self.node))
    }

    /// Disable interruption for this effect.
    pub fn uninterruptible(self) -> Self {
        Self::from_node(Node::set_interruptible(false, self.node))
    }

    // ------------------------------------------------------------------
    // Environment
    // ------------------------------------------------------------------

    /// Run this effect with `context` as its whole context.
    pub fn provide_context(self, context: Context) -> Self {
        Self::from_node(Arc::new(Node::Provide(context, self.node)))
    }

    /// Run this effect with `service` added to the current context.
    pub fn provide_service<S: Value>(self, service: S) -> Self {
        Self::from_node(Node::provide_service(
            erase(service),
            std::any::type_name::<S>(),
            self.node,
        ))
    }
}

impl<A: Value> Effect<A, Infallible> {
    /// Lift an effect that cannot fail into any error type.
    pub fn widen<E: Value>(self) -> Effect<A, E> {
        Effect::from_node(self.node)
    }
}

impl Effect<()> {
    /// Succeed with `()`.
    pub fn unit() -> Self {
        Self::from_node(Node::unit())
    }

    /// Give the thread back to the scheduler at normal priority.
    pub fn yield_now() -> Self {
        Self::yield_with(Priority::Normal)
    }

    /// Give the thread back to the scheduler at `priority`.
    pub fn yield_with(priority: Priority) -> Self {
        Self::from_node(Arc::new(Node::Yield(priority)))
    }

    /// Log `message` at info level.
    pub fn log(message: impl Into<String>) -> Self {
        Self::log_at(LogLevel::Info, message)
    }

    /// Log `message` at `level`, if the `current_log_level` ref allows it.
    pub fn log_at(level: LogLevel, message: impl Into<String>) -> Self {
        let message: Arc<str> = Arc::from(message.into());
        Self::from_node(Node::with_fiber(move |fiber, state| {
            if level.enabled(state.refs.get(current_log_level())) {
                let annotations = state.refs.get(current_log_annotations());
                log::emit(level, fiber.id(), &annotations, &message);
            }
            Node::unit()
        }))
    }

    /// Register a finalizer on the current scope.
    pub fn add_finalizer<F>(finalizer: F) -> Self
    where
        F: Fn(&ErasedExit) -> Effect<()> + Send + Sync + 'static,
    {
        let finalizer = Arc::new(finalizer);
        Effect::scope().flat_map(move |scope| {
            let finalizer = finalizer.clone();
            scope.add_finalizer(move |exit| finalizer(exit))
        })
    }
}

impl Effect<FiberId> {
    /// The id of the current fiber.
    pub fn fiber_id() -> Self {
        Self::from_node(Node::with_fiber(|fiber, _| Node::succeed(erase(fiber.id()))))
    }
}

impl Effect<Scope> {
    /// The current scope: the `Scope` service if one is provided, else the
    /// fiber's own scope.
    pub fn scope() -> Self {
        Self::from_node(Node::with_fiber(|_, state| {
            Node::succeed(erase(state.current_scope()))
        }))
    }
}
