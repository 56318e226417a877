//! # Fibers
//!
//! Identity, status and handles for lightweight, cooperatively-scheduled
//! units of execution.
//!
//! ## Design
//!
//! - A fiber is owned by its [`FiberRuntime`](crate::fiber_runtime::FiberRuntime);
//!   everything in this module is a cheap handle or a plain value describing it.
//! - [`RuntimeFiber`] is the untyped handle passed to supervisors.
//! - [`Fiber<A, E>`] is the typed handle returned by `fork`; its operations are
//!   effects (`join`, `await_exit`, `interrupt`, `interrupt_fork`).

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::effect::Effect;
use crate::exit::Exit;
use crate::fiber_runtime::FiberRuntime;
use crate::value::{unerase_exit, ErasedExit, Value};

/// Unique identifier for a fiber.
///
/// Ids are allocated from a process-wide monotonic counter and carry the wall
/// clock time (milliseconds since the Unix epoch) at which the fiber was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId {
    id: u64,
    started_at_millis: u64,
}

impl FiberId {
    /// Create a fiber ID from its parts.
    pub const fn new(id: u64, started_at_millis: u64) -> Self {
        Self {
            id,
            started_at_millis,
        }
    }

    /// The id used for interruptions issued from outside any fiber.
    pub const fn none() -> Self {
        Self::new(0, 0)
    }

    /// Check if this is the `none` id.
    pub fn is_none(&self) -> bool {
        self.id == 0
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.id
    }

    /// Creation time in milliseconds since the Unix epoch.
    pub fn started_at_millis(&self) -> u64 {
        self.started_at_millis
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            f.write_str("#none")
        } else {
            write!(f, "#{}", self.id)
        }
    }
}

/// Global fiber ID counter.
static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a new unique fiber ID.
pub fn next_fiber_id() -> FiberId {
    let id = NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed);
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    FiberId::new(id, millis)
}

/// Priority level for scheduled work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    /// Low priority (background tasks).
    Low = 0,
    /// Normal priority (default).
    #[default]
    Normal = 1,
    /// High priority (latency-sensitive).
    High = 2,
    /// Critical priority (system tasks).
    Critical = 3,
}

impl Priority {
    /// All priorities, highest first.
    pub const DESCENDING: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// Runtime flags of a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuntimeFlags(u8);

impl RuntimeFlags {
    /// No flags.
    pub const NONE: Self = Self(0);
    /// Interrupt signals are delivered at checkpoints.
    pub const INTERRUPTION: Self = Self(0b001);
    /// The fiber yields to its scheduler once its step budget is spent.
    pub const COOPERATIVE_YIELDING: Self = Self(0b010);
    /// The fiber is finishing; interruption is disabled for good.
    pub const WIND_DOWN: Self = Self(0b100);

    /// Create from raw bits.
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & 0b111)
    }

    /// Get raw bits.
    pub const fn bits(&self) -> u8 {
        self.0
    }

    /// Check whether every flag in `other` is set.
    pub const fn contains(&self, other: RuntimeFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the flags in `other`.
    pub const fn with(self, other: RuntimeFlags) -> Self {
        Self(self.0 | other.0)
    }

    /// Clear the flags in `other`.
    pub const fn without(self, other: RuntimeFlags) -> Self {
        Self(self.0 & !other.0)
    }

    /// Set or clear the flags in `other`.
    pub const fn set(self, other: RuntimeFlags, on: bool) -> Self {
        if on {
            self.with(other)
        } else {
            self.without(other)
        }
    }

    /// Whether interrupt signals may be delivered right now.
    pub fn interruptible(&self) -> bool {
        self.contains(Self::INTERRUPTION) && !self.contains(Self::WIND_DOWN)
    }

    /// Whether cooperative yielding is on.
    pub fn cooperative_yielding(&self) -> bool {
        self.contains(Self::COOPERATIVE_YIELDING)
    }

    /// Whether the fiber is winding down.
    pub fn wind_down(&self) -> bool {
        self.contains(Self::WIND_DOWN)
    }
}

impl Default for RuntimeFlags {
    fn default() -> Self {
        Self::INTERRUPTION.with(Self::COOPERATIVE_YIELDING)
    }
}

/// Fiber execution status.
///
/// Not comparable: a finished status holds a type-erased exit.
#[derive(Debug, Clone)]
pub enum FiberStatus {
    /// Executing, or ready to execute.
    Running {
        /// Whether interruption is currently enabled.
        interruptible: bool,
    },
    /// Waiting on an asynchronous callback.
    Suspended {
        /// Whether interruption is currently enabled.
        interruptible: bool,
        /// The fiber being waited on, if any.
        blocking_on: Option<FiberId>,
    },
    /// Finished with an exit.
    Done(ErasedExit),
}

impl FiberStatus {
    /// Check if the fiber has finished.
    pub fn is_done(&self) -> bool {
        matches!(self, FiberStatus::Done(_))
    }

    /// Check if the fiber is suspended.
    pub fn is_suspended(&self) -> bool {
        matches!(self, FiberStatus::Suspended { .. })
    }
}

// ============================================================================
// Handles
// ============================================================================

/// Untyped handle to a running fiber.
#[derive(Clone)]
pub struct RuntimeFiber(pub(crate) Arc<FiberRuntime>);

impl RuntimeFiber {
    /// The fiber id.
    pub fn id(&self) -> FiberId {
        self.0.id()
    }

    /// Snapshot of the current status.
    pub fn status(&self) -> FiberStatus {
        self.0.status()
    }

    /// Check if the fiber has finished.
    pub fn is_done(&self) -> bool {
        self.0.is_done()
    }

    /// The exit, if the fiber has finished.
    pub fn unsafe_poll(&self) -> Option<ErasedExit> {
        self.0.poll()
    }

    /// Request interruption from outside any fiber, without waiting. The
    /// interruptor is [`FiberId::none`].
    pub fn unsafe_interrupt(&self) {
        self.0.interrupt_external();
    }
}

impl PartialEq for RuntimeFiber {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for RuntimeFiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeFiber")
            .field("id", &self.id())
            .field("done", &self.is_done())
            .finish()
    }
}

/// A typed handle to a forked fiber.
pub struct Fiber<A, E> {
    inner: RuntimeFiber,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for Fiber<A, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A, E> fmt::Debug for Fiber<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Fiber").field(&self.inner.id()).finish()
    }
}

impl<A: Value, E: Value> Fiber<A, E> {
    pub(crate) fn new(inner: RuntimeFiber) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }

    /// The fiber id.
    pub fn id(&self) -> FiberId {
        self.inner.id()
    }

    /// The untyped handle.
    pub fn runtime_fiber(&self) -> &RuntimeFiber {
        &self.inner
    }

    /// Wait for the fiber and resume with its result. If it succeeded, its
    /// fiber refs are merged into the caller.
    ///
    /// Joining a finished fiber any number of times yields the same exit.
    pub fn join(&self) -> Effect<A, E> {
        Effect::from_node(self.inner.0.join_node())
    }

    /// Wait for the fiber's exit without merging its fiber refs.
    pub fn await_exit(&self) -> Effect<Exit<A, E>> {
        Effect::<ErasedExit>::from_node(self.inner.0.await_node())
            .map(|exit| unerase_exit::<A, E>(&exit))
    }

    /// Interrupt the fiber and wait for its exit.
    pub fn interrupt(&self) -> Effect<Exit<A, E>> {
        Effect::<ErasedExit>::from_node(self.inner.0.interrupt_node())
            .map(|exit| unerase_exit::<A, E>(&exit))
    }

    /// Interrupt the fiber without waiting for it to finish.
    pub fn interrupt_fork(&self) -> Effect<()> {
        Effect::from_node(self.inner.0.interrupt_fork_node())
    }

    /// The exit, if the fiber has already finished.
    pub fn unsafe_poll(&self) -> Option<Exit<A, E>> {
        self.inner.unsafe_poll().map(|exit| unerase_exit(&exit))
    }

    /// Check if the fiber has finished.
    pub fn is_done(&self) -> bool {
        self.inner.is_done()
    }

    /// Request interruption from outside any fiber, without waiting.
    pub fn unsafe_interrupt(&self) {
        self.inner.unsafe_interrupt();
    }
}

// ============================================================================
// Tests
// ============================================================================
