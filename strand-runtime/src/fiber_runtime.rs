//! # Fiber Runtime
//!
//! The interpreter: one [`FiberRuntime`] owns one fiber's operation stack,
//! status, fiber refs, children and scope, and reduces its effect tree in a
//! single flat loop.
//!
//! ## Design
//!
//! - The reduction loop is a trampoline over an explicit `Vec<Frame>`, so the
//!   depth of a program is bounded by memory, not by the host stack.
//! - A fiber is driven by messages. `Resume` carries the next node to reduce,
//!   `Interrupt` carries an interruption cause. Anyone may send a message from
//!   any thread; a `running` flag makes sure only one thread drains the inbox,
//!   and the drain itself runs as a task on the fiber's [`Scheduler`].
//! - `FiberState` is only touched by the draining thread. Observers and status
//!   live in a separate, short-lived lock so other fibers can await this one.
//! - Interruption is checked at every step. While the fiber is interruptible
//!   a pending interruption replaces the next step with a failure; `Fold`
//!   handlers are skipped on the way out so interruption cannot be caught.
//! - Completing the root reduction starts a wind-down: the fiber turns
//!   uninterruptible, interrupts and awaits its children, closes its scope and
//!   only then publishes its exit.
//!
//! [`Scheduler`]: crate::scheduler::Scheduler

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cause::{Cause, Defect};
use crate::effect::{unit_value, CauseHandler, Cont, Effect, Node, Register};
use crate::exit::Exit;
use crate::fiber::{next_fiber_id, FiberId, FiberStatus, Priority, RuntimeFiber, RuntimeFlags};
use crate::fiber_ref::{
    current_context, current_max_ops_before_yield, current_supervisor, ErasedFiberRef, FiberRefs,
};
use crate::scheduler::SchedulerRef;
use crate::scope::Scope;
use crate::value::{erase, type_mismatch, unerase, AnyValue, ErasedExit};

// ============================================================================
// Messages and frames
// ============================================================================

/// A message sent to a fiber's inbox.
pub(crate) enum Message {
    /// Request interruption.
    Interrupt(Cause<AnyValue>),
    /// Continue by reducing the node.
    Resume(Arc<Node>),
}

/// A continuation on the fiber's stack.
enum Frame {
    OnSuccess(Cont),
    Fold {
        on_failure: CauseHandler,
        on_success: Cont,
    },
    RevertInterruptible(bool),
    RestoreRef {
        fiber_ref: Arc<dyn ErasedFiberRef>,
        previous: Option<AnyValue>,
    },
}

enum Step {
    Eval(Arc<Node>),
    Value(AnyValue),
    Failure(Cause<AnyValue>),
}

enum LoopExit {
    Done(ErasedExit),
    Suspended,
    Yield(Priority, Arc<Node>),
}

/// The pending async registration of a suspended fiber.
struct AsyncSlot {
    fired: Arc<AtomicBool>,
    canceler: Option<Arc<Node>>,
}

type Observer = Box<dyn FnOnce(&ErasedExit) + Send>;

/// State readable from other fibers.
struct Shared {
    status: FiberStatus,
    final_refs: Option<FiberRefs>,
    observers: Vec<(u64, Observer)>,
    next_observer: u64,
}

/// Run a user closure, turning a panic into a defect.
fn guard<T>(f: impl FnOnce() -> T) -> Result<T, Defect> {
    catch_unwind(AssertUnwindSafe(f)).map_err(Defect::from_panic)
}

// ============================================================================
// FiberState
// ============================================================================

/// The state owned by the thread draining a fiber.
pub(crate) struct FiberState {
    stack: Vec<Frame>,
    pub(crate) refs: FiberRefs,
    flags: RuntimeFlags,
    /// Interruptions received but not yet acted on.
    interrupted: Cause<AnyValue>,
    /// Live non-daemon children.
    children: Vec<RuntimeFiber>,
    scope: Scope,
    async_slot: Option<AsyncSlot>,
    /// Steps since the last yield.
    ops: usize,
    budget: usize,
    winding: bool,
    done: bool,
}

impl FiberState {
    fn new(refs: FiberRefs, flags: RuntimeFlags) -> Self {
        let mut state = Self {
            stack: Vec::new(),
            refs,
            flags,
            interrupted: Cause::Empty,
            children: Vec::new(),
            scope: Scope::new(),
            async_slot: None,
            ops: 0,
            budget: 1,
            winding: false,
            done: false,
        };
        state.refresh_budget();
        state
    }

    fn refresh_budget(&mut self) {
        self.budget = self.refs.get(current_max_ops_before_yield()).max(1);
    }

    /// The INTERRUPTION flag, regardless of wind-down.
    pub(crate) fn interruption_enabled(&self) -> bool {
        self.flags.contains(RuntimeFlags::INTERRUPTION)
    }

    fn set_interruption(&mut self, enabled: bool) {
        self.flags = self.flags.set(RuntimeFlags::INTERRUPTION, enabled);
    }

    /// The `Scope` service if one is provided, else the fiber's own scope.
    pub(crate) fn current_scope(&self) -> Scope {
        self.refs
            .get(current_context())
            .get::<Scope>()
            .unwrap_or_else(|| self.scope.clone())
    }

    fn should_interrupt(&self) -> bool {
        self.flags.interruptible() && !self.interrupted.is_empty()
    }

    fn add_interrupt(&mut self, cause: Cause<AnyValue>) {
        let known = self.interrupted.interruptors();
        if !known.is_empty() && cause.interruptors().is_subset(&known) {
            return;
        }
        self.interrupted = std::mem::take(&mut self.interrupted).then(cause);
    }
}

// ============================================================================
// ResumeHandle
// ============================================================================

/// The single-use callback handed to an async registration.
#[derive(Clone)]
pub(crate) struct ResumeHandle {
    fiber: Arc<FiberRuntime>,
    fired: Arc<AtomicBool>,
}

impl ResumeHandle {
    /// Resume the fiber with `node`. Only the first call has any effect.
    pub(crate) fn resume(&self, node: Arc<Node>) {
        if self
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.fiber.tell(Message::Resume(node));
        } else {
            tracing::debug!(fiber = %self.fiber.id, "ignoring repeated resume");
        }
    }

    pub(crate) fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

// ============================================================================
// FiberRuntime
// ============================================================================

/// One fiber: its inbox, its state and its published result.
pub(crate) struct FiberRuntime {
    id: FiberId,
    inbox: Mutex<VecDeque<Message>>,
    /// Set when an interrupt was queued since the last signal check.
    signalled: AtomicBool,
    /// Whether a drain task is scheduled or running.
    running: AtomicBool,
    state: Mutex<FiberState>,
    shared: Mutex<Shared>,
    /// The refs the fiber started with, for diffing at join.
    baseline: FiberRefs,
    /// The scheduler drain tasks go to, refreshed after each drain.
    scheduler: Mutex<SchedulerRef>,
}

impl FiberRuntime {
    pub(crate) fn new(id: FiberId, refs: FiberRefs, flags: RuntimeFlags) -> Arc<Self> {
        let scheduler = refs.scheduler();
        Arc::new(Self {
            id,
            inbox: Mutex::new(VecDeque::new()),
            signalled: AtomicBool::new(false),
            running: AtomicBool::new(false),
            shared: Mutex::new(Shared {
                status: FiberStatus::Running {
                    interruptible: flags.interruptible(),
                },
                final_refs: None,
                observers: Vec::new(),
                next_observer: 0,
            }),
            baseline: refs.clone(),
            state: Mutex::new(FiberState::new(refs, flags)),
            scheduler: Mutex::new(scheduler),
        })
    }

    pub(crate) fn id(&self) -> FiberId {
        self.id
    }

    pub(crate) fn status(&self) -> FiberStatus {
        self.shared.lock().status.clone()
    }

    pub(crate) fn is_done(&self) -> bool {
        self.shared.lock().status.is_done()
    }

    pub(crate) fn poll(&self) -> Option<ErasedExit> {
        match &self.shared.lock().status {
            FiberStatus::Done(exit) => Some(exit.clone()),
            _ => None,
        }
    }

    fn final_refs(&self) -> Option<FiberRefs> {
        self.shared.lock().final_refs.clone()
    }

    fn set_status(&self, status: FiberStatus) {
        self.shared.lock().status = status;
    }

    /// Begin reducing `node`.
    pub(crate) fn start(self: &Arc<Self>, node: Arc<Node>) {
        tracing::trace!(fiber = %self.id, "fiber started");
        self.tell(Message::Resume(node));
    }

    /// Queue a message, scheduling a drain if none is pending.
    pub(crate) fn tell(self: &Arc<Self>, message: Message) {
        let is_interrupt = matches!(message, Message::Interrupt(_));
        self.inbox.lock().push_back(message);
        if is_interrupt {
            self.signalled.store(true, Ordering::Release);
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.schedule_drain(Priority::Normal);
        }
    }

    fn schedule_drain(self: &Arc<Self>, priority: Priority) {
        let fiber = Arc::clone(self);
        let scheduler = self.scheduler.lock().clone();
        scheduler.schedule_task(Box::new(move || fiber.drain()), priority);
    }

    /// Process the inbox until it is empty or the fiber yields.
    fn drain(self: &Arc<Self>) {
        loop {
            let yielded = {
                let mut state = self.state.lock();
                let yielded = self.process_inbox(&mut state);
                *self.scheduler.lock() = state.refs.scheduler();
                yielded
            };
            if let Some(priority) = yielded {
                self.schedule_drain(priority);
                return;
            }
            self.running.store(false, Ordering::Release);
            if self.inbox.lock().is_empty()
                || self
                    .running
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
            {
                return;
            }
        }
    }

    fn process_inbox(self: &Arc<Self>, state: &mut FiberState) -> Option<Priority> {
        loop {
            let next = self.inbox.lock().pop_front();
            let message = next?;
            if state.done {
                if matches!(message, Message::Resume(_)) {
                    tracing::warn!(fiber = %self.id, "ignoring resume of a finished fiber");
                }
                continue;
            }
            let yielded = match message {
                Message::Resume(node) => self.on_resume(state, node),
                Message::Interrupt(cause) => self.on_interrupt(state, cause),
            };
            if yielded.is_some() {
                return yielded;
            }
        }
    }

    fn on_resume(self: &Arc<Self>, state: &mut FiberState, node: Arc<Node>) -> Option<Priority> {
        if state.async_slot.take().is_some() {
            self.set_status(FiberStatus::Running {
                interruptible: state.flags.interruptible(),
            });
            state.refs.get(current_supervisor()).notify_resume(self.id);
        }
        self.run(state, Step::Eval(node))
    }

    fn on_interrupt(
        self: &Arc<Self>,
        state: &mut FiberState,
        cause: Cause<AnyValue>,
    ) -> Option<Priority> {
        state.add_interrupt(cause);
        if !state.flags.interruptible() {
            return None;
        }
        let slot = state.async_slot.take()?;
        if slot
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Already resumed; the resume is queued behind this message.
            state.async_slot = Some(slot);
            return None;
        }
        tracing::trace!(fiber = %self.id, "interrupting suspended fiber");
        self.set_status(FiberStatus::Running {
            interruptible: true,
        });
        state.refs.get(current_supervisor()).notify_resume(self.id);
        self.interrupt_children(state);

        let interrupted = state.interrupted.clone();
        let node = match slot.canceler {
            Some(canceler) => {
                let after_failure = interrupted.clone();
                Node::fold(
                    canceler,
                    move |failure| Node::fail_cause(after_failure.clone().then(failure)),
                    move |_| Node::fail_cause(interrupted.clone()),
                )
            }
            None => Node::fail_cause(interrupted),
        };
        state.stack.push(Frame::RevertInterruptible(true));
        state.set_interruption(false);
        self.run(state, Step::Eval(node))
    }

    /// Move queued interrupts from the inbox into the fiber state.
    fn drain_signals(&self, state: &mut FiberState) {
        if !self.signalled.swap(false, Ordering::AcqRel) {
            return;
        }
        let mut inbox = self.inbox.lock();
        let mut kept = VecDeque::with_capacity(inbox.len());
        for message in inbox.drain(..) {
            match message {
                Message::Interrupt(cause) => state.add_interrupt(cause),
                other => kept.push_back(other),
            }
        }
        *inbox = kept;
    }

    fn interrupt_children(&self, state: &mut FiberState) {
        state.children.retain(|child| !child.is_done());
        for child in &state.children {
            child.0.tell(Message::Interrupt(Cause::Interrupt(self.id)));
        }
    }

    // ------------------------------------------------------------------
    // Reduction
    // ------------------------------------------------------------------

    /// Reduce from `step` until the fiber suspends, yields or finishes.
    fn run(self: &Arc<Self>, state: &mut FiberState, step: Step) -> Option<Priority> {
        let mut step = step;
        loop {
            match self.run_loop(state, step) {
                LoopExit::Suspended => return None,
                LoopExit::Yield(priority, node) => {
                    self.inbox.lock().push_front(Message::Resume(node));
                    return Some(priority);
                }
                LoopExit::Done(exit) if !state.winding => {
                    step = Step::Eval(self.wind_down(state, exit));
                }
                LoopExit::Done(exit) => {
                    self.complete(state, exit);
                    return None;
                }
            }
        }
    }

    fn run_loop(self: &Arc<Self>, state: &mut FiberState, step: Step) -> LoopExit {
        let mut step = step;
        loop {
            self.drain_signals(state);
            if !matches!(step, Step::Failure(_)) && state.should_interrupt() {
                self.interrupt_children(state);
                step = Step::Failure(state.interrupted.clone());
            }

            step = match step {
                Step::Eval(node) => {
                    state.ops += 1;
                    if state.ops >= state.budget && state.flags.cooperative_yielding() {
                        state.ops = 0;
                        if let Some(priority) = state.refs.scheduler().should_yield(self.id) {
                            return LoopExit::Yield(priority, node);
                        }
                    }
                    match self.eval(state, node) {
                        Ok(next) => next,
                        Err(exit) => return exit,
                    }
                }
                Step::Value(value) => match state.stack.pop() {
                    None => return LoopExit::Done(Exit::Success(value)),
                    Some(Frame::OnSuccess(k)) | Some(Frame::Fold { on_success: k, .. }) => {
                        match guard(|| k(value)) {
                            Ok(node) => Step::Eval(node),
                            Err(defect) => Step::Failure(Cause::Die(defect)),
                        }
                    }
                    Some(Frame::RevertInterruptible(enabled)) => {
                        state.set_interruption(enabled);
                        Step::Value(value)
                    }
                    Some(Frame::RestoreRef {
                        fiber_ref,
                        previous,
                    }) => {
                        restore_ref(state, fiber_ref, previous);
                        Step::Value(value)
                    }
                },
                Step::Failure(cause) => match state.stack.pop() {
                    None => return LoopExit::Done(Exit::Failure(cause)),
                    Some(Frame::OnSuccess(_)) => Step::Failure(cause),
                    Some(Frame::Fold { on_failure, .. }) => {
                        if state.should_interrupt() {
                            if cause.is_interrupted() {
                                Step::Failure(cause)
                            } else {
                                Step::Failure(cause.then(state.interrupted.clone()))
                            }
                        } else {
                            match guard(|| on_failure(cause)) {
                                Ok(node) => Step::Eval(node),
                                Err(defect) => Step::Failure(Cause::Die(defect)),
                            }
                        }
                    }
                    Some(Frame::RevertInterruptible(enabled)) => {
                        state.set_interruption(enabled);
                        Step::Failure(cause)
                    }
                    Some(Frame::RestoreRef {
                        fiber_ref,
                        previous,
                    }) => {
                        restore_ref(state, fiber_ref, previous);
                        Step::Failure(cause)
                    }
                },
            };
        }
    }

    /// Reduce one node.
    fn eval(self: &Arc<Self>, state: &mut FiberState, node: Arc<Node>) -> Result<Step, LoopExit> {
        let step = match &*node {
            Node::Succeed(value) => Step::Value(value.clone()),
            Node::Fail(cause) => match guard(|| cause()) {
                Ok(cause) => Step::Failure(cause),
                Err(defect) => Step::Failure(Cause::Die(defect)),
            },
            Node::Sync(thunk) => match guard(|| thunk()) {
                Ok(value) => Step::Value(value),
                Err(defect) => Step::Failure(Cause::Die(defect)),
            },
            Node::FlatMap(effect, k) => {
                state.stack.push(Frame::OnSuccess(k.clone()));
                Step::Eval(effect.clone())
            }
            Node::Fold {
                effect,
                on_failure,
                on_success,
            } => {
                state.stack.push(Frame::Fold {
                    on_failure: on_failure.clone(),
                    on_success: on_success.clone(),
                });
                Step::Eval(effect.clone())
            }
            Node::Fork { effect, daemon } => {
                Step::Value(erase(self.fork(state, effect.clone(), *daemon)))
            }
            Node::Provide(context, effect) => enter_locally(
                state,
                current_context().erased(),
                erase(context.clone()),
                effect.clone(),
            ),
            Node::Locally {
                fiber_ref,
                value,
                effect,
            } => enter_locally(state, fiber_ref.clone(), value.clone(), effect.clone()),
            Node::AcquireRelease { acquire, release } => {
                let scope = state.current_scope();
                let release = release.clone();
                Step::Eval(Node::set_interruptible(
                    false,
                    Node::flat_map(acquire.clone(), move |value| {
                        let release = release.clone();
                        let resource = value.clone();
                        let register = scope.add_finalizer(move |exit| {
                            Effect::from_node(release(resource.clone(), exit))
                        });
                        Node::zip_right(register.node, Node::succeed(value))
                    }),
                ))
            }
            Node::SetInterruptible(enabled, effect) => {
                let current = state.interruption_enabled();
                if current != *enabled {
                    state.stack.push(Frame::RevertInterruptible(current));
                    state.set_interruption(*enabled);
                }
                Step::Eval(effect.clone())
            }
            Node::Yield(priority) => {
                state.ops = 0;
                return Err(LoopExit::Yield(*priority, Node::unit()));
            }
            Node::WithFiber(f) => {
                let result = guard(|| f(self, state));
                state.refresh_budget();
                match result {
                    Ok(node) => Step::Eval(node),
                    Err(defect) => Step::Failure(Cause::Die(defect)),
                }
            }
            Node::Async {
                register,
                blocking_on,
            } => return self.suspend(state, register, *blocking_on),
        };
        Ok(step)
    }

    fn suspend(
        self: &Arc<Self>,
        state: &mut FiberState,
        register: &Register,
        blocking_on: Option<FiberId>,
    ) -> Result<Step, LoopExit> {
        let fired = Arc::new(AtomicBool::new(false));
        state.async_slot = Some(AsyncSlot {
            fired: fired.clone(),
            canceler: None,
        });
        self.set_status(FiberStatus::Suspended {
            interruptible: state.flags.interruptible(),
            blocking_on,
        });
        let supervisor = state.refs.get(current_supervisor());
        supervisor.notify_suspend(self.id);

        let handle = ResumeHandle {
            fiber: Arc::clone(self),
            fired: fired.clone(),
        };
        match guard(|| register(handle)) {
            Ok(canceler) => {
                if let Some(slot) = state.async_slot.as_mut() {
                    slot.canceler = canceler;
                }
                Err(LoopExit::Suspended)
            }
            Err(defect) => {
                if fired
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    state.async_slot = None;
                    self.set_status(FiberStatus::Running {
                        interruptible: state.flags.interruptible(),
                    });
                    supervisor.notify_resume(self.id);
                    Ok(Step::Failure(Cause::Die(defect)))
                } else {
                    tracing::warn!(
                        fiber = %self.id,
                        defect = %defect,
                        "async registration panicked after resuming"
                    );
                    Err(LoopExit::Suspended)
                }
            }
        }
    }

    fn fork(self: &Arc<Self>, state: &mut FiberState, effect: Arc<Node>, daemon: bool) -> RuntimeFiber {
        let refs = state.refs.forked();
        let flags = state.flags.without(RuntimeFlags::WIND_DOWN);
        let child = RuntimeFiber(FiberRuntime::new(next_fiber_id(), refs, flags));
        if !daemon {
            state.children.retain(|c| !c.is_done());
            state.children.push(child.clone());
        }
        state
            .refs
            .get(current_supervisor())
            .notify_start(&child, Some(self.id));
        tracing::trace!(parent = %self.id, child = %child.id(), daemon, "fiber forked");
        child.0.start(effect);
        child
    }

    // ------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------

    /// Build the node that interrupts and awaits the children, then closes
    /// the scope with `exit`.
    fn wind_down(&self, state: &mut FiberState, exit: ErasedExit) -> Arc<Node> {
        state.winding = true;
        state.flags = state
            .flags
            .with(RuntimeFlags::WIND_DOWN)
            .without(RuntimeFlags::INTERRUPTION);

        let mut node = Node::unit();
        for child in std::mem::take(&mut state.children) {
            if child.is_done() {
                continue;
            }
            child.0.tell(Message::Interrupt(Cause::Interrupt(self.id)));
            node = Node::zip_right(node, child.0.await_node());
        }
        let close = state.scope.close(exit.clone()).node;
        Node::then_exit(Node::zip_right(node, close), exit)
    }

    fn complete(&self, state: &mut FiberState, exit: ErasedExit) {
        state.done = true;
        state.async_slot = None;
        state.stack.clear();
        state
            .refs
            .get(current_supervisor())
            .notify_end(self.id, &exit);
        let observers = {
            let mut shared = self.shared.lock();
            shared.status = FiberStatus::Done(exit.clone());
            shared.final_refs = Some(state.refs.clone());
            std::mem::take(&mut shared.observers)
        };
        match &exit {
            Exit::Success(_) => tracing::debug!(fiber = %self.id, "fiber succeeded"),
            Exit::Failure(cause) => {
                tracing::debug!(fiber = %self.id, cause = %cause.pretty(), "fiber failed")
            }
        }
        for (_, observer) in observers {
            if let Err(defect) = guard(|| observer(&exit)) {
                tracing::error!(fiber = %self.id, defect = %defect, "exit observer panicked");
            }
        }
    }

    /// Call `observer` with the exit once the fiber is done. Runs it right
    /// away if the fiber already finished, returning `None`.
    fn add_observer(&self, observer: Observer) -> Option<u64> {
        let mut shared = self.shared.lock();
        if let FiberStatus::Done(exit) = &shared.status {
            let exit = exit.clone();
            drop(shared);
            observer(&exit);
            return None;
        }
        let id = shared.next_observer;
        shared.next_observer += 1;
        shared.observers.push((id, observer));
        Some(id)
    }

    fn remove_observer(&self, id: u64) {
        self.shared.lock().observers.retain(|(i, _)| *i != id);
    }

    // ------------------------------------------------------------------
    // Nodes acting on this fiber
    // ------------------------------------------------------------------

    /// Suspend until this fiber is done, succeeding with its erased exit.
    pub(crate) fn await_node(self: &Arc<Self>) -> Arc<Node> {
        let target = Arc::clone(self);
        let register: Register = Arc::new(move |handle: ResumeHandle| {
            let resume = handle.clone();
            let observer = target.add_observer(Box::new(move |exit: &ErasedExit| {
                resume.resume(Node::succeed(erase(exit.clone())));
            }));
            observer.map(|id| {
                let target = target.clone();
                Node::sync(move || {
                    target.remove_observer(id);
                    unit_value()
                })
            })
        });
        Node::async_(register, Some(self.id))
    }

    /// Await this fiber and complete with its exit. A successful child's refs
    /// are merged into the caller.
    pub(crate) fn join_node(self: &Arc<Self>) -> Arc<Node> {
        let child = Arc::clone(self);
        Node::flat_map(self.await_node(), move |value| {
            let child = child.clone();
            Node::with_fiber(move |_, state| {
                let Some(exit) = unerase::<ErasedExit>(&value) else {
                    return Node::die(type_mismatch::<ErasedExit>());
                };
                if exit.is_success() {
                    if let Some(final_refs) = child.final_refs() {
                        state.refs.join(&child.baseline, &final_refs);
                    }
                }
                Node::from_exit(&exit)
            })
        })
    }

    /// Interrupt this fiber on behalf of the caller and await its exit.
    pub(crate) fn interrupt_node(self: &Arc<Self>) -> Arc<Node> {
        Node::zip_right(self.interrupt_fork_node(), self.await_node())
    }

    /// Interrupt this fiber on behalf of the caller without waiting.
    pub(crate) fn interrupt_fork_node(self: &Arc<Self>) -> Arc<Node> {
        let target = Arc::clone(self);
        Node::with_fiber(move |caller, _| {
            target.tell(Message::Interrupt(Cause::Interrupt(caller.id())));
            Node::unit()
        })
    }

    /// Interrupt this fiber from outside any fiber.
    pub(crate) fn interrupt_external(self: &Arc<Self>) {
        self.tell(Message::Interrupt(Cause::Interrupt(FiberId::none())));
    }
}

fn enter_locally(
    state: &mut FiberState,
    fiber_ref: Arc<dyn ErasedFiberRef>,
    value: AnyValue,
    effect: Arc<Node>,
) -> Step {
    let previous = state.refs.lookup(fiber_ref.id());
    state.stack.push(Frame::RestoreRef {
        fiber_ref: fiber_ref.clone(),
        previous,
    });
    state.refs.set_erased(fiber_ref, value);
    state.refresh_budget();
    Step::Eval(effect)
}

fn restore_ref(state: &mut FiberState, fiber_ref: Arc<dyn ErasedFiberRef>, previous: Option<AnyValue>) {
    match previous {
        Some(value) => state.refs.set_erased(fiber_ref, value),
        None => state.refs.remove(fiber_ref.id()),
    }
    state.refresh_budget();
}

impl std::fmt::Debug for FiberRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberRuntime")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber_ref::current_scheduler;
    use crate::scheduler::Executor;

    fn spawn(executor: &Arc<Executor>, node: Arc<Node>) -> Arc<FiberRuntime> {
        let scheduler: SchedulerRef = executor.clone();
        let refs = FiberRefs::new().with(current_scheduler(), scheduler);
        let fiber = FiberRuntime::new(next_fiber_id(), refs, RuntimeFlags::default());
        fiber.start(node);
        fiber
    }

    #[test]
    fn test_pure_node_completes() {
        let executor = Arc::new(Executor::new());
        let node = Node::flat_map(Node::succeed(erase(20_i32)), |v| {
            let n = unerase::<i32>(&v).unwrap_or_default();
            Node::succeed(erase(n + 1))
        });
        let fiber = spawn(&executor, node);
        executor.run_until_idle();
        let exit = fiber.poll().expect("fiber should be done");
        assert_eq!(exit.value().and_then(unerase::<i32>), Some(21));
    }

    #[test]
    fn test_status_suspended_then_interrupted() {
        let executor = Arc::new(Executor::new());
        let register: Register = Arc::new(|_: ResumeHandle| None);
        let fiber = spawn(&executor, Node::async_(register, None));
        executor.run_until_idle();
        assert!(fiber.status().is_suspended());

        fiber.interrupt_external();
        executor.run_until_idle();
        let exit = fiber.poll().expect("fiber should be done");
        assert!(exit.is_interrupted());
    }

    #[test]
    fn test_fail_thunk_panic_is_defect() {
        let executor = Arc::new(Executor::new());
        let node = Arc::new(Node::Fail(Arc::new(|| -> Cause<AnyValue> { panic!("no cause") })));
        let fiber = spawn(&executor, node);
        executor.run_until_idle();
        let exit = fiber.poll().expect("fiber should be done");
        assert!(exit.cause().is_some_and(|c| c.is_die()));
    }

    #[test]
    fn test_observer_runs_immediately_when_done() {
        let executor = Arc::new(Executor::new());
        let fiber = spawn(&executor, Node::unit());
        executor.run_until_idle();
        let seen = Arc::new(AtomicBool::new(false));
        let flag = seen.clone();
        let id = fiber.add_observer(Box::new(move |exit| {
            flag.store(exit.is_success(), Ordering::SeqCst);
        }));
        assert!(id.is_none());
        assert!(seen.load(Ordering::SeqCst));
    }
}
