//! The terminal outcome of a fiber.

use crate::cause::{Cause, Defect};
use crate::fiber::FiberId;

/// How a fiber (or any effect run to completion) ended.
///
/// A fiber produces its exit exactly once; every joiner observes the same value.
#[derive(Debug, Clone, PartialEq)]
pub enum Exit<A, E> {
    /// Completed with a value.
    Success(A),
    /// Completed with a failure.
    Failure(Cause<E>),
}

impl<A, E> Exit<A, E> {
    /// A successful exit.
    pub fn succeed(value: A) -> Self {
        Exit::Success(value)
    }

    /// A typed failure.
    pub fn fail(error: E) -> Self {
        Exit::Failure(Cause::Fail(error))
    }

    /// A failure with an arbitrary cause.
    pub fn fail_cause(cause: Cause<E>) -> Self {
        Exit::Failure(cause)
    }

    /// A defect.
    pub fn die(defect: Defect) -> Self {
        Exit::Failure(Cause::Die(defect))
    }

    /// An interruption by `fiber`.
    pub fn interrupt(fiber: FiberId) -> Self {
        Exit::Failure(Cause::Interrupt(fiber))
    }

    /// Check if the exit is a success.
    pub fn is_success(&self) -> bool {
        matches!(self, Exit::Success(_))
    }

    /// Check if the exit is a failure.
    pub fn is_failure(&self) -> bool {
        matches!(self, Exit::Failure(_))
    }

    /// Check if the exit failed because of an interruption.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Exit::Failure(cause) if cause.is_interrupted())
    }

    /// The success value, if any.
    pub fn value(&self) -> Option<&A> {
        match self {
            Exit::Success(a) => Some(a),
            Exit::Failure(_) => None,
        }
    }

    /// The failure cause, if any.
    pub fn cause(&self) -> Option<&Cause<E>> {
        match self {
            Exit::Success(_) => None,
            Exit::Failure(cause) => Some(cause),
        }
    }

    /// Map the success value.
    pub fn map<B>(self, f: impl FnOnce(A) -> B) -> Exit<B, E> {
        match self {
            Exit::Success(a) => Exit::Success(f(a)),
            Exit::Failure(cause) => Exit::Failure(cause),
        }
    }

    /// Append a cause that happened after this exit, e.g. a failing finalizer.
    ///
    /// A success followed by a failure becomes that failure; a failure keeps its
    /// own cause first.
    pub fn then_cause(self, after: Cause<E>) -> Self {
        if after.is_empty() {
            return self;
        }
        match self {
            Exit::Success(_) => Exit::Failure(after),
            Exit::Failure(cause) => Exit::Failure(cause.then(after)),
        }
    }

    /// Convert into a `Result`, keeping the full cause on failure.
    pub fn into_result(self) -> Result<A, Cause<E>> {
        match self {
            Exit::Success(a) => Ok(a),
            Exit::Failure(cause) => Err(cause),
        }
    }
}

impl<A, E> From<Result<A, E>> for Exit<A, E> {
    fn from(result: Result<A, E>) -> Self {
        match result {
            Ok(a) => Exit::Success(a),
            Err(e) => Exit::fail(e),
        }
    }
}
