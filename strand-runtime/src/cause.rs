//! Structured Failure Causes
//!
//! A [`Cause`] records *everything* that went wrong in a fiber, not just the
//! first error:
//!
//! - **Fail**: an expected, typed error declared by the program
//! - **Die**: a defect, i.e. a panic or a violated invariant
//! - **Interrupt**: cooperative cancellation, tagged with the interrupting fiber
//!
//! Causes compose with [`Cause::then`] (one after another, e.g. a failure
//! followed by a failing finalizer) and [`Cause::both`] (concurrently, e.g. two
//! children failing independently). `Empty` is the identity of both.

use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::fiber::FiberId;

/// An unexpected failure.
///
/// Defects are produced when user code panics inside the interpreter or when a
/// runtime invariant is broken. They are never caught by typed error handlers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Defect {
    message: Arc<str>,
}

impl Defect {
    /// Create a defect with a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Arc::from(message.into()),
        }
    }

    /// Build a defect from a panic payload.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        Self::new(message)
    }

    /// The defect message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// The full story of a failure.
#[derive(Debug, Clone, PartialEq)]
pub enum Cause<E> {
    /// Nothing failed.
    Empty,
    /// An expected, typed failure.
    Fail(E),
    /// An unexpected defect.
    Die(Defect),
    /// Interruption requested by the given fiber.
    Interrupt(FiberId),
    /// The left cause happened, then the right one.
    Sequential(Box<Cause<E>>, Box<Cause<E>>),
    /// Both causes happened concurrently.
    Parallel(Box<Cause<E>>, Box<Cause<E>>),
}

impl<E> Default for Cause<E> {
    fn default() -> Self {
        Cause::Empty
    }
}

impl<E> Cause<E> {
    /// The empty cause.
    pub fn empty() -> Self {
        Cause::Empty
    }

    /// A typed failure.
    pub fn fail(error: E) -> Self {
        Cause::Fail(error)
    }

    /// A defect with a message.
    pub fn die(message: impl Into<String>) -> Self {
        Cause::Die(Defect::new(message))
    }

    /// An interruption by `fiber`.
    pub fn interrupt(fiber: FiberId) -> Self {
        Cause::Interrupt(fiber)
    }

    /// Sequential composition. `Empty` on either side is dropped.
    pub fn then(self, next: Cause<E>) -> Cause<E> {
        match (self.is_empty(), next.is_empty()) {
            (true, _) => next,
            (_, true) => self,
            _ => Cause::Sequential(Box::new(self), Box::new(next)),
        }
    }

    /// Parallel composition. `Empty` on either side is dropped.
    pub fn both(self, other: Cause<E>) -> Cause<E> {
        match (self.is_empty(), other.is_empty()) {
            (true, _) => other,
            (_, true) => self,
            _ => Cause::Parallel(Box::new(self), Box::new(other)),
        }
    }

    /// Visit every leaf, left to right.
    fn for_each_leaf(&self, mut visit: impl FnMut(&Cause<E>)) {
        let mut pending = vec![self];
        while let Some(cause) = pending.pop() {
            match cause {
                Cause::Sequential(l, r) | Cause::Parallel(l, r) => {
                    pending.push(r);
                    pending.push(l);
                }
                leaf => visit(leaf),
            }
        }
    }

    fn any_leaf(&self, mut pred: impl FnMut(&Cause<E>) -> bool) -> bool {
        let mut found = false;
        self.for_each_leaf(|leaf| found = found || pred(leaf));
        found
    }

    /// True when no leaf carries a failure, defect, or interruption.
    pub fn is_empty(&self) -> bool {
        !self.any_leaf(|leaf| !matches!(leaf, Cause::Empty))
    }

    /// True when the cause contains at least one typed failure.
    pub fn is_failure(&self) -> bool {
        self.any_leaf(|leaf| matches!(leaf, Cause::Fail(_)))
    }

    /// True when the cause contains at least one defect.
    pub fn is_die(&self) -> bool {
        self.any_leaf(|leaf| matches!(leaf, Cause::Die(_)))
    }

    /// True when the cause contains at least one interruption.
    pub fn is_interrupted(&self) -> bool {
        self.any_leaf(|leaf| matches!(leaf, Cause::Interrupt(_)))
    }

    /// True when the cause is made of interruptions and nothing else.
    pub fn is_interrupted_only(&self) -> bool {
        self.is_interrupted() && !self.any_leaf(|leaf| matches!(leaf, Cause::Fail(_) | Cause::Die(_)))
    }

    /// The first typed failure, if any.
    pub fn first_failure(&self) -> Option<&E> {
        let mut pending = vec![self];
        while let Some(cause) = pending.pop() {
            match cause {
                Cause::Fail(e) => return Some(e),
                Cause::Sequential(l, r) | Cause::Parallel(l, r) => {
                    pending.push(r);
                    pending.push(l);
                }
                _ => {}
            }
        }
        None
    }

    /// All defects, left to right.
    pub fn defects(&self) -> Vec<Defect> {
        let mut out = Vec::new();
        self.for_each_leaf(|leaf| {
            if let Cause::Die(d) = leaf {
                out.push(d.clone());
            }
        });
        out
    }

    /// Every fiber that requested an interruption recorded in this cause.
    pub fn interruptors(&self) -> HashSet<FiberId> {
        let mut out = HashSet::new();
        self.for_each_leaf(|leaf| {
            if let Cause::Interrupt(id) = leaf {
                out.insert(*id);
            }
        });
        out
    }

    /// Transform the typed failures.
    pub fn map<E2>(&self, mut f: impl FnMut(&E) -> E2) -> Cause<E2> {
        self.flat_map_failures(|e| Cause::Fail(f(e)))
    }

    /// Replace every typed failure with a whole cause.
    pub fn flat_map_failures<E2>(&self, mut f: impl FnMut(&E) -> Cause<E2>) -> Cause<E2> {
        fn go<E, E2>(cause: &Cause<E>, f: &mut dyn FnMut(&E) -> Cause<E2>) -> Cause<E2> {
            match cause {
                Cause::Empty => Cause::Empty,
                Cause::Fail(e) => f(e),
                Cause::Die(d) => Cause::Die(d.clone()),
                Cause::Interrupt(id) => Cause::Interrupt(*id),
                Cause::Sequential(l, r) => go(l, f).then(go(r, f)),
                Cause::Parallel(l, r) => go(l, f).both(go(r, f)),
            }
        }
        go(self, &mut f)
    }

    /// Drop the typed failures, keeping defects and interruptions.
    pub fn strip_failures<E2>(&self) -> Cause<E2> {
        self.flat_map_failures(|_| Cause::Empty)
    }
}

impl<E: Clone> Cause<E> {
    /// Drop the interruptions, keeping failures and defects.
    pub fn strip_interruptions(&self) -> Cause<E> {
        match self {
            Cause::Interrupt(_) | Cause::Empty => Cause::Empty,
            Cause::Fail(e) => Cause::Fail(e.clone()),
            Cause::Die(d) => Cause::Die(d.clone()),
            Cause::Sequential(l, r) => l.strip_interruptions().then(r.strip_interruptions()),
            Cause::Parallel(l, r) => l.strip_interruptions().both(r.strip_interruptions()),
        }
    }

    /// All typed failures, left to right.
    pub fn failures(&self) -> Vec<E> {
        let mut out = Vec::new();
        self.for_each_leaf(|leaf| {
            if let Cause::Fail(e) = leaf {
                out.push(e.clone());
            }
        });
        out
    }

    /// The first typed failure, or the cause itself if it holds none.
    ///
    /// This is how typed handlers decide whether they may recover: a cause
    /// without a `Fail` leaf is a defect or an interruption and is passed on.
    pub fn failure_or_cause(self) -> Result<E, Cause<E>> {
        match self.first_failure() {
            Some(e) => Ok(e.clone()),
            None => Err(self),
        }
    }
}

impl<E: fmt::Debug> Cause<E> {
    /// One rendered line per leaf, left to right.
    pub fn pretty_errors(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.for_each_leaf(|leaf| match leaf {
            Cause::Fail(e) => out.push(format!("Error: {:?}", e)),
            Cause::Die(d) => out.push(format!("Defect: {}", d)),
            Cause::Interrupt(id) => out.push(format!("Interrupted by {}", id)),
            _ => {}
        });
        out
    }

    /// A multi-line rendering of the whole cause.
    pub fn pretty(&self) -> String {
        let errors = self.pretty_errors();
        if errors.is_empty() {
            "All fibers interrupted without errors.".to_string()
        } else {
            errors.join("\n")
        }
    }
}

impl<E: fmt::Debug> fmt::Display for Cause<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pretty())
    }
}
