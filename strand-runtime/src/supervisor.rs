//! Supervisors
//!
//! A [`Supervisor`] observes fiber lifecycle events: start, end, suspension
//! and resumption. Supervisors are stateful and expose a snapshot of that
//! state through [`Supervisor::value`].
//!
//! # Design
//!
//! - The active supervisor is the `current_supervisor` fiber ref, so it is
//!   inherited by forked fibers. [`Effect::supervised`](crate::Effect::supervised)
//!   adds a supervisor for the fibers forked inside one effect.
//! - Hooks are synchronous and fire-and-forget. A panicking hook is caught
//!   and logged; it never fails the fiber it observes.
//! - Supervisors compose with [`Supervisor::zip`] and [`Supervisor::map`].
//!
//! # Example
//!
//! ```rust,ignore
//! use strand_runtime::{Effect, supervisor::LifecycleCounter};
//!
//! let counter = LifecycleCounter::new();
//! let program = Effect::supervised(counter.clone(), Effect::<()>::unit().fork());
//! // after running: counter.value().started == 1
//! ```

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cause::Defect;
use crate::fiber::{FiberId, RuntimeFiber};
use crate::value::ErasedExit;

/// Observer of fiber lifecycle events.
pub trait Supervisor: Send + Sync + 'static {
    /// Snapshot type.
    type Value;

    /// The current snapshot.
    fn value(&self) -> Self::Value;

    /// A fiber was started. `parent` is `None` for root fibers.
    fn on_start(&self, fiber: &RuntimeFiber, parent: Option<FiberId>) {
        let _ = (fiber, parent);
    }

    /// A fiber finished with `exit`.
    fn on_end(&self, fiber: FiberId, exit: &ErasedExit) {
        let _ = (fiber, exit);
    }

    /// A fiber suspended on an asynchronous callback.
    fn on_suspend(&self, fiber: FiberId) {
        let _ = fiber;
    }

    /// A suspended fiber resumed.
    fn on_resume(&self, fiber: FiberId) {
        let _ = fiber;
    }

    /// Notify both supervisors; the snapshot is the pair of snapshots.
    fn zip<S>(self, other: S) -> Zip<Self, S>
    where
        Self: Sized,
        S: Supervisor,
    {
        Zip {
            left: self,
            right: other,
        }
    }

    /// Transform the snapshot.
    fn map<B, F>(self, f: F) -> Map<Self, F>
    where
        Self: Sized,
        F: Fn(Self::Value) -> B + Send + Sync + 'static,
    {
        Map { inner: self, f }
    }
}

/// Object-safe view of a supervisor's hooks.
pub(crate) trait LifecycleHooks: Send + Sync {
    fn start(&self, fiber: &RuntimeFiber, parent: Option<FiberId>);
    fn end(&self, fiber: FiberId, exit: &ErasedExit);
    fn suspend(&self, fiber: FiberId);
    fn resume(&self, fiber: FiberId);
}

impl<S: Supervisor> LifecycleHooks for S {
    fn start(&self, fiber: &RuntimeFiber, parent: Option<FiberId>) {
        self.on_start(fiber, parent);
    }

    fn end(&self, fiber: FiberId, exit: &ErasedExit) {
        self.on_end(fiber, exit);
    }

    fn suspend(&self, fiber: FiberId) {
        self.on_suspend(fiber);
    }

    fn resume(&self, fiber: FiberId) {
        self.on_resume(fiber);
    }
}

/// Run a hook, containing any panic.
fn notify(event: &'static str, fiber: FiberId, hook: impl FnOnce()) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(hook)) {
        let defect = Defect::from_panic(payload);
        tracing::warn!(fiber = %fiber, event, panic = %defect, "supervisor hook panicked");
    }
}

/// Type-erased supervisor, as stored in the `current_supervisor` fiber ref.
#[derive(Clone, Default)]
pub struct SupervisorRef {
    hooks: Option<Arc<dyn LifecycleHooks>>,
}

impl SupervisorRef {
    /// The supervisor that observes nothing.
    pub fn none() -> Self {
        Self { hooks: None }
    }

    /// Erase a supervisor.
    pub fn new<S: Supervisor>(supervisor: S) -> Self {
        Self {
            hooks: Some(Arc::new(supervisor)),
        }
    }

    /// Check if this is the no-op supervisor.
    pub fn is_none(&self) -> bool {
        self.hooks.is_none()
    }

    /// Notify both supervisors.
    pub fn combine(&self, other: &SupervisorRef) -> SupervisorRef {
        match (&self.hooks, &other.hooks) {
            (None, _) => other.clone(),
            (_, None) => self.clone(),
            _ => SupervisorRef::new(Zip {
                left: self.clone(),
                right: other.clone(),
            }),
        }
    }

    pub(crate) fn notify_start(&self, fiber: &RuntimeFiber, parent: Option<FiberId>) {
        if let Some(hooks) = &self.hooks {
            notify("start", fiber.id(), || hooks.start(fiber, parent));
        }
    }

    pub(crate) fn notify_end(&self, fiber: FiberId, exit: &ErasedExit) {
        if let Some(hooks) = &self.hooks {
            notify("end", fiber, || hooks.end(fiber, exit));
        }
    }

    pub(crate) fn notify_suspend(&self, fiber: FiberId) {
        if let Some(hooks) = &self.hooks {
            notify("suspend", fiber, || hooks.suspend(fiber));
        }
    }

    pub(crate) fn notify_resume(&self, fiber: FiberId) {
        if let Some(hooks) = &self.hooks {
            notify("resume", fiber, || hooks.resume(fiber));
        }
    }
}

impl Supervisor for SupervisorRef {
    type Value = ();

    fn value(&self) {}

    fn on_start(&self, fiber: &RuntimeFiber, parent: Option<FiberId>) {
        if let Some(hooks) = &self.hooks {
            hooks.start(fiber, parent);
        }
    }

    fn on_end(&self, fiber: FiberId, exit: &ErasedExit) {
        if let Some(hooks) = &self.hooks {
            hooks.end(fiber, exit);
        }
    }

    fn on_suspend(&self, fiber: FiberId) {
        if let Some(hooks) = &self.hooks {
            hooks.suspend(fiber);
        }
    }

    fn on_resume(&self, fiber: FiberId) {
        if let Some(hooks) = &self.hooks {
            hooks.resume(fiber);
        }
    }
}

impl PartialEq for SupervisorRef {
    fn eq(&self, other: &Self) -> bool {
        match (&self.hooks, &other.hooks) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for SupervisorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupervisorRef")
            .field("none", &self.is_none())
            .finish()
    }
}

// ============================================================================
// Combinators
// ============================================================================

/// Two supervisors notified in order. See [`Supervisor::zip`].
#[derive(Debug, Clone)]
pub struct Zip<L, R> {
    left: L,
    right: R,
}

impl<L: Supervisor, R: Supervisor> Supervisor for Zip<L, R> {
    type Value = (L::Value, R::Value);

    fn value(&self) -> Self::Value {
        (self.left.value(), self.right.value())
    }

    // Contain each side on its own.
    fn on_start(&self, fiber: &RuntimeFiber, parent: Option<FiberId>) {
        notify("start", fiber.id(), || self.left.on_start(fiber, parent));
        notify("start", fiber.id(), || self.right.on_start(fiber, parent));
    }

    fn on_end(&self, fiber: FiberId, exit: &ErasedExit) {
        notify("end", fiber, || self.left.on_end(fiber, exit));
        notify("end", fiber, || self.right.on_end(fiber, exit));
    }

    fn on_suspend(&self, fiber: FiberId) {
        notify("suspend", fiber, || self.left.on_suspend(fiber));
        notify("suspend", fiber, || self.right.on_suspend(fiber));
    }

    fn on_resume(&self, fiber: FiberId) {
        notify("resume", fiber, || self.left.on_resume(fiber));
        notify("resume", fiber, || self.right.on_resume(fiber));
    }
}

/// A supervisor with a transformed snapshot. See [`Supervisor::map`].
#[derive(Clone)]
pub struct Map<S, F> {
    inner: S,
    f: F,
}

impl<S, F, B> Supervisor for Map<S, F>
where
    S: Supervisor,
    F: Fn(S::Value) -> B + Send + Sync + 'static,
{
    type Value = B;

    fn value(&self) -> B {
        (self.f)(self.inner.value())
    }

    fn on_start(&self, fiber: &RuntimeFiber, parent: Option<FiberId>) {
        self.inner.on_start(fiber, parent);
    }

    fn on_end(&self, fiber: FiberId, exit: &ErasedExit) {
        self.inner.on_end(fiber, exit);
    }

    fn on_suspend(&self, fiber: FiberId) {
        self.inner.on_suspend(fiber);
    }

    fn on_resume(&self, fiber: FiberId) {
        self.inner.on_resume(fiber);
    }
}

// ============================================================================
// Provided supervisors
// ============================================================================

/// Observes nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSupervisor;

impl Supervisor for NoSupervisor {
    type Value = ();

    fn value(&self) {}
}

/// Tracks the fibers that are currently alive.
#[derive(Clone, Default)]
pub struct Track {
    fibers: Arc<Mutex<HashMap<FiberId, RuntimeFiber>>>,
}

impl Track {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Supervisor for Track {
    type Value = Vec<RuntimeFiber>;

    /// Live fibers, oldest first.
    fn value(&self) -> Vec<RuntimeFiber> {
        let mut fibers: Vec<_> = self.fibers.lock().values().cloned().collect();
        fibers.sort_by_key(|f| f.id());
        fibers
    }

    fn on_start(&self, fiber: &RuntimeFiber, _parent: Option<FiberId>) {
        self.fibers.lock().insert(fiber.id(), fiber.clone());
    }

    fn on_end(&self, fiber: FiberId, _exit: &ErasedExit) {
        self.fibers.lock().remove(&fiber);
    }
}

impl fmt::Debug for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Track")
            .field("live", &self.fibers.lock().len())
            .finish()
    }
}

/// Counts of lifecycle events seen by a [`LifecycleCounter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LifecycleCounts {
    /// Fibers started.
    pub started: u64,
    /// Fibers finished.
    pub ended: u64,
    /// Suspensions.
    pub suspended: u64,
    /// Resumptions after a suspension.
    pub resumed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    started: AtomicU64,
    ended: AtomicU64,
    suspended: AtomicU64,
    resumed: AtomicU64,
}

/// Counts lifecycle events.
#[derive(Debug, Clone, Default)]
pub struct LifecycleCounter {
    counters: Arc<Counters>,
}

impl LifecycleCounter {
    /// Create a counter with every count at zero.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Supervisor for LifecycleCounter {
    type Value = LifecycleCounts;

    fn value(&self) -> LifecycleCounts {
        LifecycleCounts {
            started: self.counters.started.load(Ordering::Acquire),
            ended: self.counters.ended.load(Ordering::Acquire),
            suspended: self.counters.suspended.load(Ordering::Acquire),
            resumed: self.counters.resumed.load(Ordering::Acquire),
        }
    }

    fn on_start(&self, _fiber: &RuntimeFiber, _parent: Option<FiberId>) {
        self.counters.started.fetch_add(1, Ordering::AcqRel);
    }

    fn on_end(&self, _fiber: FiberId, _exit: &ErasedExit) {
        self.counters.ended.fetch_add(1, Ordering::AcqRel);
    }

    fn on_suspend(&self, _fiber: FiberId) {
        self.counters.suspended.fetch_add(1, Ordering::AcqRel);
    }

    fn on_resume(&self, _fiber: FiberId) {
        self.counters.resumed.fetch_add(1, Ordering::AcqRel);
    }
}
