//! Errors returned by the run adapters on [`Runtime`](crate::Runtime).

use std::fmt;

use crate::cause::Cause;
use crate::fiber::FiberId;

/// Why running an effect did not produce a value.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RunError<E: fmt::Debug> {
    /// The effect failed or died.
    #[error("{rendered}")]
    Failed {
        /// The first error, pretty-printed.
        rendered: String,
        /// The full cause.
        cause: Cause<E>,
    },
    /// The fiber was interrupted and nothing else went wrong.
    #[error("fiber {fiber} was interrupted")]
    Interrupted {
        /// The interrupted fiber.
        fiber: FiberId,
        /// The interruption cause.
        cause: Cause<E>,
    },
    /// The effect suspended and could not finish synchronously.
    #[error("fiber {0} cannot complete synchronously: it is suspended at an async boundary")]
    AsyncBoundary(FiberId),
}

impl<E: Clone + fmt::Debug> RunError<E> {
    /// Classify the failure cause of `fiber`.
    pub fn from_cause(fiber: FiberId, cause: Cause<E>) -> Self {
        if cause.is_interrupted_only() {
            return RunError::Interrupted { fiber, cause };
        }
        let rendered = cause
            .strip_interruptions()
            .pretty_errors()
            .into_iter()
            .next()
            .unwrap_or_else(|| "fiber failed with an empty cause".to_string());
        RunError::Failed { rendered, cause }
    }
}

impl<E: fmt::Debug> RunError<E> {
    /// The cause, unless the effect never finished.
    pub fn cause(&self) -> Option<&Cause<E>> {
        match self {
            RunError::Failed { cause, .. } | RunError::Interrupted { cause, .. } => Some(cause),
            RunError::AsyncBoundary(_) => None,
        }
    }

    /// Check if this is an interruption.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, RunError::Interrupted { .. })
    }
}
