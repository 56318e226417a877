//! Type erasure for values flowing through the interpreter.
//!
//! The interpreter works on one untyped representation, `AnyValue`, so that a
//! single flat loop can reduce every node. The typed [`Effect`](crate::Effect)
//! surface erases on the way in and downcasts on the way out.

use std::any::{type_name, Any};
use std::sync::Arc;

use crate::cause::{Cause, Defect};
use crate::exit::Exit;

/// An erased, shareable value.
pub type AnyValue = Arc<dyn Any + Send + Sync>;

/// An exit whose success and failure payloads are erased.
pub type ErasedExit = Exit<AnyValue, AnyValue>;

/// Bound for everything an effect can produce or fail with.
///
/// Values are shared between every observer of a fiber's exit, so they must be
/// cheap to clone and safe to hand across threads.
pub trait Value: Any + Clone + Send + Sync {}

impl<T: Any + Clone + Send + Sync> Value for T {}

/// Erase a typed value.
///
/// Erasing an `AnyValue` is the identity, so erased payloads never get wrapped
/// twice.
pub(crate) fn erase<T: Value>(value: T) -> AnyValue {
    let boxed: Box<dyn Any + Send + Sync> = Box::new(value);
    match boxed.downcast::<AnyValue>() {
        Ok(erased) => *erased,
        Err(other) => Arc::from(other),
    }
}

/// Recover a typed value, or `None` if the payload has another type.
pub(crate) fn unerase<T: Value>(value: &AnyValue) -> Option<T> {
    value
        .downcast_ref::<T>()
        .cloned()
        .or_else(|| (value as &dyn Any).downcast_ref::<T>().cloned())
}

/// The defect raised when an erased payload does not have the expected type.
pub(crate) fn type_mismatch<T>() -> Defect {
    Defect::new(format!("value is not of the expected type `{}`", type_name::<T>()))
}

pub(crate) fn erase_cause<E: Value>(cause: Cause<E>) -> Cause<AnyValue> {
    cause.map(|e| erase(e.clone()))
}

/// Downcast the typed failures of an erased cause. Failures of an unexpected
/// type become defects rather than being dropped.
pub(crate) fn unerase_cause<E: Value>(cause: &Cause<AnyValue>) -> Cause<E> {
    cause.flat_map_failures(|e| match unerase::<E>(e) {
        Some(e) => Cause::Fail(e),
        None => Cause::Die(type_mismatch::<E>()),
    })
}

pub(crate) fn erase_exit<A: Value, E: Value>(exit: Exit<A, E>) -> ErasedExit {
    match exit {
        Exit::Success(a) => Exit::Success(erase(a)),
        Exit::Failure(cause) => Exit::Failure(erase_cause(cause)),
    }
}

pub(crate) fn unerase_exit<A: Value, E: Value>(exit: &ErasedExit) -> Exit<A, E> {
    match exit {
        Exit::Success(v) => match unerase::<A>(v) {
            Some(a) => Exit::Success(a),
            None => Exit::Failure(Cause::Die(type_mismatch::<A>())),
        },
        Exit::Failure(cause) => Exit::Failure(unerase_cause(cause)),
    }
}
