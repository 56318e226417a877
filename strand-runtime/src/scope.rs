//! Scopes and Finalization
//!
//! A [`Scope`] owns the finalizers of resources acquired during its lifetime
//! and releases them, exactly once and in reverse order, when it is closed.
//!
//! # Design
//!
//! Every fiber has its own scope, closed with the fiber's exit during
//! wind-down. [`Effect::scoped`](crate::Effect::scoped) runs an effect in a
//! fresh scope, provided as a service so that nested `acquire_release` calls
//! register against it.
//!
//! # Components
//!
//! - `Scope::add_finalizer`: register cleanup; on a closed scope it runs at once
//! - `Scope::close`: run finalizers most-recently-added first, idempotent
//! - `Scope::fork`: a child scope closed no later than its parent
//! - `Scope::extend_into`: hand the finalizers over to a longer-lived scope
//!
//! # Example
//!
//! ```rust,ignore
//! use strand_runtime::Effect;
//!
//! let program = Effect::scoped(
//!     Effect::<()>::add_finalizer(|_| Effect::log("released second"))
//!         .zip_right(Effect::add_finalizer(|_| Effect::log("released first"))),
//! );
//! ```

use std::convert::Infallible;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cause::Cause;
use crate::effect::Effect;
use crate::exit::Exit;
use crate::value::ErasedExit;

/// Counter for generating unique scope IDs.
static SCOPE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Cleanup registered on a scope, called with the scope's exit.
pub type Finalizer = Arc<dyn Fn(&ErasedExit) -> Effect<()> + Send + Sync>;

enum ScopeState {
    /// Accepting finalizers, in registration order.
    Open(Vec<Finalizer>),
    /// Finalizers were handed over to another scope.
    Extended(Scope),
    /// Closed with an exit.
    Closed(ErasedExit),
}

struct ScopeInner {
    id: u64,
    state: Mutex<ScopeState>,
}

/// A lifetime owning finalizers.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

impl Scope {
    /// Create an open scope.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                id: SCOPE_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
                state: Mutex::new(ScopeState::Open(Vec::new())),
            }),
        }
    }

    /// Get the scope ID.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Check if the scope was closed.
    pub fn is_closed(&self) -> bool {
        matches!(*self.inner.state.lock(), ScopeState::Closed(_))
    }

    /// Number of finalizers waiting to run.
    pub fn pending_finalizers(&self) -> usize {
        match &*self.inner.state.lock() {
            ScopeState::Open(finalizers) => finalizers.len(),
            ScopeState::Extended(_) | ScopeState::Closed(_) => 0,
        }
    }

    /// Register a finalizer, or hand it back with the exit if the scope is
    /// already closed.
    fn register(&self, finalizer: Finalizer) -> Result<(), (Finalizer, ErasedExit)> {
        let target = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                ScopeState::Open(finalizers) => {
                    finalizers.push(finalizer);
                    return Ok(());
                }
                ScopeState::Closed(exit) => return Err((finalizer, exit.clone())),
                ScopeState::Extended(target) => target.clone(),
            }
        };
        target.register(finalizer)
    }

    /// Register `finalizer` to run when the scope closes. If the scope is
    /// already closed it runs immediately with the scope's exit.
    pub fn add_finalizer<F>(&self, finalizer: F) -> Effect<()>
    where
        F: Fn(&ErasedExit) -> Effect<()> + Send + Sync + 'static,
    {
        let scope = self.clone();
        let finalizer: Finalizer = Arc::new(finalizer);
        Effect::suspend(move || match scope.register(finalizer.clone()) {
            Ok(()) => Effect::unit(),
            Err((finalizer, exit)) => finalizer(&exit),
        })
    }

    /// Close the scope with `exit`, running its finalizers most recently
    /// added first. Closing again does nothing.
    ///
    /// Every finalizer runs even if an earlier one fails; the failures are
    /// combined sequentially into the resulting cause. The close itself is
    /// uninterruptible.
    pub fn close(&self, exit: ErasedExit) -> Effect<()> {
        let scope = self.clone();
        Effect::suspend(move || {
            let finalizers = {
                let mut state = scope.inner.state.lock();
                match std::mem::replace(&mut *state, ScopeState::Closed(exit.clone())) {
                    ScopeState::Open(finalizers) => finalizers,
                    previous @ (ScopeState::Closed(_) | ScopeState::Extended(_)) => {
                        *state = previous;
                        return Effect::unit();
                    }
                }
            };
            tracing::trace!(scope = scope.id(), finalizers = finalizers.len(), "closing scope");
            run_finalizers(finalizers, exit.clone())
        })
        .uninterruptible()
    }

    /// Create a child scope that is closed when this one closes, if it was
    /// not closed before.
    pub fn fork(&self) -> Effect<Scope> {
        let parent = self.clone();
        Effect::suspend(move || {
            let child = Scope::new();
            let closing = child.clone();
            parent
                .add_finalizer(move |exit| closing.close(exit.clone()))
                .map(move |_| child.clone())
        })
    }

    /// Move this scope's finalizers into `parent`, so they run when `parent`
    /// closes instead. Finalizers added later go to `parent` as well.
    pub fn extend_into(&self, parent: &Scope) -> Effect<()> {
        let scope = self.clone();
        let parent = parent.clone();
        Effect::suspend(move || {
            let moved = {
                let mut state = scope.inner.state.lock();
                match &mut *state {
                    ScopeState::Open(finalizers) => {
                        let moved = std::mem::take(finalizers);
                        *state = ScopeState::Extended(parent.clone());
                        moved
                    }
                    ScopeState::Extended(_) | ScopeState::Closed(_) => return Effect::unit(),
                }
            };
            moved.into_iter().fold(Effect::unit(), |acc, finalizer| {
                acc.zip_right(parent.add_finalizer(move |exit| finalizer(exit)))
            })
        })
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Scope {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.inner.state.lock() {
            ScopeState::Open(_) => "open",
            ScopeState::Extended(_) => "extended",
            ScopeState::Closed(_) => "closed",
        };
        f.debug_struct("Scope")
            .field("id", &self.inner.id)
            .field("state", &state)
            .finish()
    }
}

/// Run `finalizers` in reverse, folding their failures into one cause.
fn run_finalizers(finalizers: Vec<Finalizer>, exit: ErasedExit) -> Effect<()> {
    let all: Effect<Cause<Infallible>> = finalizers.into_iter().rev().fold(
        Effect::succeed(Cause::Empty),
        |acc, finalizer| {
            let exit = exit.clone();
            acc.flat_map(move |cause| {
                let finalizer = finalizer.clone();
                let exit = exit.clone();
                Effect::suspend(move || finalizer(&exit))
                    .exit()
                    .map(move |result| match result {
                        Exit::Success(()) => cause.clone(),
                        Exit::Failure(failure) => cause.clone().then(failure),
                    })
            })
        },
    );
    all.flat_map(|cause| {
        if cause.is_empty() {
            Effect::unit()
        } else {
            Effect::fail_cause(cause)
        }
    })
}
