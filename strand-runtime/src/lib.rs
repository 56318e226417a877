//! # Strand Runtime Library
//!
//! A structured-concurrency fiber runtime:
//!
//! - **Effects**: immutable descriptions of computations, run by a trampolined
//!   interpreter with constant native stack depth
//! - **Fibers**: lightweight, cooperatively-scheduled executions with
//!   asynchronous, deferrable interruption
//! - **Scopes**: finalizers that run exactly once, in reverse order
//! - **Fiber Refs**: fiber-local values with fork/join merge semantics
//! - **Supervisors**: lifecycle observers for every fiber
//!
//! ## Technical Standards
//!
//! - **Work Stealing**: the worker pool balances fibers with
//!   [crossbeam-deque](https://docs.rs/crossbeam-deque)
//! - **Errors**: typed failures, defects and interruptions are kept apart in
//!   [`Cause`]; run adapters report [`RunError`]
//! - **Logging**: runtime events and `Effect::log` go through
//!   [tracing](https://docs.rs/tracing)
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        STRAND RUNTIME                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │   Runtime    │  │    Effect    │  │    Scope     │          │
//! │  │ (runtime.rs) │  │ (effect.rs)  │  │  (scope.rs)  │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │         │                 │                 │                   │
//! │         └─────────────────┼─────────────────┘                   │
//! │                           │                                     │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │  Scheduler   │  │FiberRuntime  │  │  Fiber Refs  │          │
//! │  │(scheduler.rs)│  │(fiber_runtime│  │(fiber_ref.rs)│          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │                                                                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use strand_runtime::{Effect, Runtime};
//!
//! let program = Effect::<i32, String>::succeed(1)
//!     .fork()
//!     .widen()
//!     .flat_map(|fiber| fiber.join())
//!     .map(|n| n + 1);
//!
//! assert_eq!(Runtime::default().run_sync(program), Ok(2));
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod cause;
pub mod config;
pub mod context;
pub mod differ;
pub mod effect;
pub mod error;
pub mod exit;
pub mod fiber;
pub mod fiber_ref;
pub(crate) mod fiber_runtime;
pub mod log;
pub mod runtime;
pub mod scheduler;
pub mod scope;
pub mod supervisor;
pub mod value;

// Re-exports
pub use cause::{Cause, Defect};
pub use config::{ConfigError, RuntimeConfig, RuntimeConfigBuilder};
pub use context::Context;
pub use differ::{Differ, HashMapDiffer, HashSetDiffer, SumDiffer, UpdateDiffer, ZipDiffer};
pub use effect::{Effect, Restore, Resume};
pub use error::RunError;
pub use exit::Exit;
pub use fiber::{Fiber, FiberId, FiberStatus, Priority, RuntimeFiber, RuntimeFlags};
pub use fiber_ref::{
    current_context, current_log_annotations, current_log_level, current_max_ops_before_yield,
    current_scheduler, current_supervisor, FiberRef, FiberRefs,
};
pub use log::LogLevel;
pub use runtime::Runtime;
pub use scheduler::{Executor, Scheduler, SchedulerRef, Task, WorkerPool};
pub use scope::{Finalizer, Scope};
pub use supervisor::{LifecycleCounter, LifecycleCounts, NoSupervisor, Supervisor, SupervisorRef, Track};
pub use value::{AnyValue, ErasedExit, Value};

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize a runtime with default configuration.
pub fn init() -> Runtime {
    init_with_config(RuntimeConfig::default())
}

/// Initialize a runtime with full runtime configuration.
///
/// # Example
///
/// ```rust,ignore
/// use strand_runtime::{init_with_config, RuntimeConfig};
///
/// let config = RuntimeConfig::builder()
///     .num_workers(4)
///     .max_ops_before_yield(512)
///     .build()
///     .unwrap();
///
/// let runtime = init_with_config(config);
/// ```
pub fn init_with_config(config: RuntimeConfig) -> Runtime {
    Runtime::from_config(&config)
}

/// Initialize a runtime from environment variables.
///
/// Reads configuration from `STRAND_*` environment variables.
/// See `RuntimeConfig::from_env()` for the full list of supported variables.
pub fn init_from_env() -> Runtime {
    init_with_config(RuntimeConfig::from_env())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_with_config_is_per_runtime() {
        let small = RuntimeConfig::builder()
            .num_workers(1)
            .max_ops_before_yield(32)
            .build()
            .unwrap();
        let large = RuntimeConfig::builder()
            .num_workers(1)
            .max_ops_before_yield(4096)
            .build()
            .unwrap();
        let first = init_with_config(small);
        let second = init_with_config(large);
        assert_eq!(first.fiber_refs().get(current_max_ops_before_yield()), 32);
        assert_eq!(second.fiber_refs().get(current_max_ops_before_yield()), 4096);
    }

    #[test]
    fn test_version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
