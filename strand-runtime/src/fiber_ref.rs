//! Fiber-Local References
//!
//! A [`FiberRef`] is a fiber-local variable with defined fork and join
//! semantics, similar to thread-local storage but scoped to fibers and their
//! structure.
//!
//! # Overview
//!
//! - Each fiber owns a [`FiberRefs`] store mapping ref identity to value. A ref
//!   that was never set reads as its initial value.
//! - At fork, the child's store is the parent's store with each ref's fork
//!   transform applied. That forked store is remembered as the child's baseline.
//! - At join, for every ref the child changed, the parent's value becomes
//!   `differ.patch(differ.diff(baseline, child_final), parent_current)`.
//!   Refs the child left alone are skipped.
//!
//! Runtime tunables are ordinary fiber refs: see [`current_scheduler`],
//! [`current_max_ops_before_yield`], [`current_log_level`],
//! [`current_log_annotations`], [`current_context`] and [`current_supervisor`].
//!
//! # Example
//!
//! ```rust,ignore
//! use strand_runtime::{Effect, FiberRef};
//!
//! let hits = FiberRef::sum(0_i64);
//! let child = hits.update(|n| n + 1).fork();
//! let both = child.clone().flat_map(move |a| {
//!     child.clone().flat_map(move |b| a.join().zip_right(b.join()))
//! });
//! let program = both.zip_right(hits.get()); // 2, whatever the join order
//! ```

use std::collections::HashMap;
use std::fmt;
use std::ops::{Add, Sub};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use crate::context::{Context, ContextDiffer};
use crate::differ::{Differ, HashMapDiffer, SumDiffer, UpdateDiffer};
use crate::effect::{Effect, Node};
use crate::log::LogLevel;
use crate::scheduler::{default_scheduler, SchedulerRef};
use crate::supervisor::SupervisorRef;
use crate::value::{erase, unerase, AnyValue, Value};

/// Default number of reduction steps a fiber runs before offering to yield.
pub const DEFAULT_MAX_OPS_BEFORE_YIELD: usize = 2048;

/// Allocate a unique ref id.
fn next_ref_id() -> u64 {
    static NEXT_REF_ID: AtomicU64 = AtomicU64::new(1);
    NEXT_REF_ID.fetch_add(1, Ordering::Relaxed)
}

/// The type-erased view of a fiber ref used by the interpreter.
pub(crate) trait ErasedFiberRef: Send + Sync {
    fn id(&self) -> u64;
    fn initial(&self) -> &AnyValue;
    fn fork(&self, value: &AnyValue) -> AnyValue;
    fn join(&self, parent: &AnyValue, base: &AnyValue, child: &AnyValue) -> AnyValue;
}

type ForkFn<V> = Box<dyn Fn(&V) -> V + Send + Sync>;
type JoinFn<V> = Box<dyn Fn(&V, &V, &V) -> V + Send + Sync>;

struct FiberRefInner<V> {
    id: u64,
    initial: V,
    initial_erased: AnyValue,
    /// `None` means children inherit the parent's value unchanged.
    fork: Option<ForkFn<V>>,
    /// `(parent, base, child) -> merged`.
    join: JoinFn<V>,
}

impl<V: Value> ErasedFiberRef for FiberRefInner<V> {
    fn id(&self) -> u64 {
        self.id
    }

    fn initial(&self) -> &AnyValue {
        &self.initial_erased
    }

    fn fork(&self, value: &AnyValue) -> AnyValue {
        match (&self.fork, unerase::<V>(value)) {
            (Some(fork), Some(v)) => erase(fork(&v)),
            _ => value.clone(),
        }
    }

    fn join(&self, parent: &AnyValue, base: &AnyValue, child: &AnyValue) -> AnyValue {
        match (unerase::<V>(parent), unerase::<V>(base), unerase::<V>(child)) {
            (Some(p), Some(b), Some(c)) => erase((self.join)(&p, &b, &c)),
            _ => child.clone(),
        }
    }
}

/// A fiber-local variable.
pub struct FiberRef<V> {
    inner: Arc<FiberRefInner<V>>,
}

impl<V> Clone for FiberRef<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> fmt::Debug for FiberRef<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberRef").field("id", &self.inner.id).finish()
    }
}

impl<V: Value> FiberRef<V> {
    /// A ref whose children inherit the parent's value and whose last write
    /// wins at join.
    pub fn new(initial: V) -> Self {
        Self::with_differ(initial, UpdateDiffer::<V>::new())
    }

    /// A ref merged at join with `differ`.
    pub fn with_differ<D>(initial: V, differ: D) -> Self
    where
        D: Differ<Value = V>,
    {
        Self::build(initial, None, differ)
    }

    /// A ref merged at join with `differ`, whose value is transformed by
    /// `fork` when a child fiber is created.
    pub fn with_fork<D, F>(initial: V, differ: D, fork: F) -> Self
    where
        D: Differ<Value = V>,
        F: Fn(&V) -> V + Send + Sync + 'static,
    {
        Self::build(initial, Some(Box::new(fork)), differ)
    }

    fn build<D>(initial: V, fork: Option<ForkFn<V>>, differ: D) -> Self
    where
        D: Differ<Value = V>,
    {
        let join: JoinFn<V> =
            Box::new(move |parent, base, child| differ.patch(&differ.diff(base, child), parent));
        Self {
            inner: Arc::new(FiberRefInner {
                id: next_ref_id(),
                initial_erased: erase(initial.clone()),
                initial,
                fork,
                join,
            }),
        }
    }

    /// The ref's identity.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The initial value.
    pub fn initial(&self) -> &V {
        &self.inner.initial
    }

    pub(crate) fn erased(&self) -> Arc<dyn ErasedFiberRef> {
        self.inner.clone()
    }

    /// Read the current fiber's value.
    pub fn get(&self) -> Effect<V> {
        let fiber_ref = self.erased();
        Effect::from_node(Node::with_fiber(move |_, state| {
            Node::succeed(state.refs.get_erased(&*fiber_ref))
        }))
    }

    /// Replace the current fiber's value.
    pub fn set(&self, value: V) -> Effect<()> {
        let fiber_ref = self.erased();
        let value = erase(value);
        Effect::from_node(Node::with_fiber(move |_, state| {
            state.refs.set_erased(fiber_ref.clone(), value.clone());
            Node::unit()
        }))
    }

    /// Reset to the initial value.
    pub fn reset(&self) -> Effect<()> {
        let fiber_ref = self.erased();
        Effect::from_node(Node::with_fiber(move |_, state| {
            let initial = fiber_ref.initial().clone();
            state.refs.set_erased(fiber_ref.clone(), initial);
            Node::unit()
        }))
    }

    /// Update the value and return a result computed from the old one.
    pub fn modify<B, F>(&self, f: F) -> Effect<B>
    where
        B: Value,
        F: Fn(V) -> (B, V) + Send + Sync + 'static,
    {
        let this = self.clone();
        Effect::from_node(Node::with_fiber(move |_, state| {
            let current = state.refs.get(&this);
            let (result, next) = f(current);
            state.refs.set(&this, next);
            Node::succeed(erase(result))
        }))
    }

    /// Update the value.
    pub fn update<F>(&self, f: F) -> Effect<()>
    where
        F: Fn(V) -> V + Send + Sync + 'static,
    {
        self.modify(move |v| ((), f(v)))
    }

    /// Update the value and return the new one.
    pub fn update_and_get<F>(&self, f: F) -> Effect<V>
    where
        F: Fn(V) -> V + Send + Sync + 'static,
    {
        self.modify(move |v| {
            let next = f(v);
            (next.clone(), next)
        })
    }

    /// Run `effect` with the value set to `value`, restoring the previous value
    /// on every exit path.
    pub fn locally<A: Value, E: Value>(&self, value: V, effect: Effect<A, E>) -> Effect<A, E> {
        Effect::from_node(Node::locally(self.erased(), erase(value), effect.node))
    }

    /// Run `effect` with the value transformed by `f`, restoring the previous
    /// value on every exit path.
    pub fn locally_with<A, E, F>(&self, f: F, effect: Effect<A, E>) -> Effect<A, E>
    where
        A: Value,
        E: Value,
        F: Fn(V) -> V + Send + Sync + 'static,
    {
        let this = self.clone();
        let node = effect.node;
        Effect::from_node(Node::with_fiber(move |_, state| {
            let next = f(state.refs.get(&this));
            Node::locally(this.erased(), erase(next), node.clone())
        }))
    }
}

impl<N> FiberRef<N>
where
    N: Value + Default + Add<Output = N> + Sub<Output = N> + Copy,
{
    /// An additive ref: concurrent changes made by children add up at join.
    pub fn sum(initial: N) -> Self {
        Self::with_differ(initial, SumDiffer::<N>::new())
    }
}

// ============================================================================
// Store
// ============================================================================

#[derive(Clone)]
struct Entry {
    fiber_ref: Arc<dyn ErasedFiberRef>,
    value: AnyValue,
}

/// A fiber's ref store: ref identity to current value.
///
/// Copy-on-write, so snapshots (fork baselines, final values) are cheap.
#[derive(Clone, Default)]
pub struct FiberRefs {
    entries: Arc<HashMap<u64, Entry>>,
}

impl FiberRefs {
    /// An empty store: every ref reads as its initial value.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of refs with an explicit value.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if no ref has an explicit value.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Read a ref.
    pub fn get<V: Value>(&self, fiber_ref: &FiberRef<V>) -> V {
        self.entries
            .get(&fiber_ref.id())
            .and_then(|entry| unerase::<V>(&entry.value))
            .unwrap_or_else(|| fiber_ref.initial().clone())
    }

    /// Write a ref.
    pub fn set<V: Value>(&mut self, fiber_ref: &FiberRef<V>, value: V) {
        self.set_erased(fiber_ref.erased(), erase(value));
    }

    /// Builder-style [`set`](Self::set).
    pub fn with<V: Value>(mut self, fiber_ref: &FiberRef<V>, value: V) -> Self {
        self.set(fiber_ref, value);
        self
    }

    pub(crate) fn get_erased(&self, fiber_ref: &dyn ErasedFiberRef) -> AnyValue {
        self.entries
            .get(&fiber_ref.id())
            .map(|entry| entry.value.clone())
            .unwrap_or_else(|| fiber_ref.initial().clone())
    }

    /// The explicit value of a ref, if any.
    pub(crate) fn lookup(&self, id: u64) -> Option<AnyValue> {
        self.entries.get(&id).map(|entry| entry.value.clone())
    }

    pub(crate) fn set_erased(&mut self, fiber_ref: Arc<dyn ErasedFiberRef>, value: AnyValue) {
        Arc::make_mut(&mut self.entries).insert(fiber_ref.id(), Entry { fiber_ref, value });
    }

    pub(crate) fn remove(&mut self, id: u64) {
        if self.entries.contains_key(&id) {
            Arc::make_mut(&mut self.entries).remove(&id);
        }
    }

    /// The store a child fiber starts with.
    pub(crate) fn forked(&self) -> FiberRefs {
        let entries = self
            .entries
            .iter()
            .map(|(id, entry)| {
                let value = entry.fiber_ref.fork(&entry.value);
                (
                    *id,
                    Entry {
                        fiber_ref: entry.fiber_ref.clone(),
                        value,
                    },
                )
            })
            .collect();
        FiberRefs {
            entries: Arc::new(entries),
        }
    }

    /// Merge a finished child's refs into this store.
    ///
    /// `baseline` is the store the child started with.
    pub(crate) fn join(&mut self, baseline: &FiberRefs, child: &FiberRefs) {
        for (id, entry) in child.entries.iter() {
            let base = baseline
                .entries
                .get(id)
                .map(|b| b.value.clone())
                .unwrap_or_else(|| entry.fiber_ref.initial().clone());
            if Arc::ptr_eq(&base, &entry.value) {
                continue;
            }
            let parent = self.get_erased(&*entry.fiber_ref);
            let merged = entry.fiber_ref.join(&parent, &base, &entry.value);
            self.set_erased(entry.fiber_ref.clone(), merged);
        }
        // A ref the child dropped from its store reads as its initial value.
        for (id, entry) in baseline.entries.iter() {
            if child.entries.contains_key(id) {
                continue;
            }
            let initial = entry.fiber_ref.initial().clone();
            if Arc::ptr_eq(&entry.value, &initial) {
                continue;
            }
            let parent = self.get_erased(&*entry.fiber_ref);
            let merged = entry.fiber_ref.join(&parent, &entry.value, &initial);
            self.set_erased(entry.fiber_ref.clone(), merged);
        }
    }

    /// The scheduler fibers with this store run on.
    pub(crate) fn scheduler(&self) -> SchedulerRef {
        self.get(current_scheduler())
    }
}

impl fmt::Debug for FiberRefs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.entries.keys().collect();
        ids.sort_unstable();
        f.debug_struct("FiberRefs").field("refs", &ids).finish()
    }
}

// ============================================================================
// Built-in refs
// ============================================================================

/// The scheduler new work is handed to.
pub fn current_scheduler() -> &'static FiberRef<SchedulerRef> {
    static REF: OnceLock<FiberRef<SchedulerRef>> = OnceLock::new();
    REF.get_or_init(|| FiberRef::new(default_scheduler()))
}

/// Reduction steps a fiber runs before offering to yield.
pub fn current_max_ops_before_yield() -> &'static FiberRef<usize> {
    static REF: OnceLock<FiberRef<usize>> = OnceLock::new();
    REF.get_or_init(|| FiberRef::new(DEFAULT_MAX_OPS_BEFORE_YIELD))
}

/// Minimum level of `Effect::log` events.
pub fn current_log_level() -> &'static FiberRef<LogLevel> {
    static REF: OnceLock<FiberRef<LogLevel>> = OnceLock::new();
    REF.get_or_init(|| FiberRef::new(LogLevel::Info))
}

/// Key/value pairs attached to every `Effect::log` event.
pub fn current_log_annotations() -> &'static FiberRef<HashMap<String, String>> {
    static REF: OnceLock<FiberRef<HashMap<String, String>>> = OnceLock::new();
    REF.get_or_init(|| FiberRef::with_differ(HashMap::new(), HashMapDiffer::new()))
}

/// Services available to effects.
pub fn current_context() -> &'static FiberRef<Context> {
    static REF: OnceLock<FiberRef<Context>> = OnceLock::new();
    REF.get_or_init(|| FiberRef::with_differ(Context::empty(), ContextDiffer))
}

/// Supervisor notified of fiber lifecycle events.
pub fn current_supervisor() -> &'static FiberRef<SupervisorRef> {
    static REF: OnceLock<FiberRef<SupervisorRef>> = OnceLock::new();
    REF.get_or_init(|| FiberRef::new(SupervisorRef::none()))
}
