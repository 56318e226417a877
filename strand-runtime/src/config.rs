//! Runtime Configuration
//!
//! Configuration for the runtime's worker pool, default fiber refs and
//! default runtime flags. It can be set programmatically or loaded from
//! environment variables, then turned into a [`Runtime`](crate::Runtime) with
//! `Runtime::from_config`.
//!
//! # Environment Variables
//!
//! All environment variables use the `STRAND_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `STRAND_NUM_WORKERS` | Number of worker threads | CPU count |
//! | `STRAND_MAX_OPS_BEFORE_YIELD` | Steps a fiber runs before offering to yield | 2048 |
//! | `STRAND_LOG_LEVEL` | Minimum level of `Effect::log` (trace/debug/info/warn/error/off) | info |
//! | `STRAND_INTERRUPTION` | Root fibers start interruptible ("true"/"false") | true |
//! | `STRAND_COOPERATIVE_YIELDING` | Fibers yield once their budget is spent ("true"/"false") | true |
//!
//! # Example
//!
//! ```rust,ignore
//! use strand_runtime::config::RuntimeConfig;
//!
//! // Load from environment with defaults
//! let config = RuntimeConfig::from_env();
//!
//! // Or use the builder pattern
//! let config = RuntimeConfig::builder()
//!     .num_workers(4)
//!     .max_ops_before_yield(512)
//!     .build()?;
//! ```

use std::env;

use crate::fiber::RuntimeFlags;
use crate::fiber_ref::DEFAULT_MAX_OPS_BEFORE_YIELD;
use crate::log::LogLevel;

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Number of worker threads.
    /// Default: number of available CPUs.
    pub num_workers: usize,

    /// Reduction steps a fiber runs before offering to yield.
    /// Default: 2048.
    pub max_ops_before_yield: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus(),
            max_ops_before_yield: DEFAULT_MAX_OPS_BEFORE_YIELD,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogConfig {
    /// Minimum level of `Effect::log` events.
    /// Default: Info.
    pub level: LogLevel,
}

/// Initial runtime flags of root fibers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagsConfig {
    /// Root fibers start interruptible.
    /// Default: true.
    pub interruption: bool,

    /// Fibers yield to their scheduler once their step budget is spent.
    /// Default: true.
    pub cooperative_yielding: bool,
}

impl Default for FlagsConfig {
    fn default() -> Self {
        Self {
            interruption: true,
            cooperative_yielding: true,
        }
    }
}

impl FlagsConfig {
    /// The runtime flags these settings describe.
    pub fn to_flags(&self) -> RuntimeFlags {
        RuntimeFlags::NONE
            .set(RuntimeFlags::INTERRUPTION, self.interruption)
            .set(RuntimeFlags::COOPERATIVE_YIELDING, self.cooperative_yielding)
    }
}

/// Complete runtime configuration.
///
/// Use `RuntimeConfig::default()` for sensible defaults, or
/// `RuntimeConfig::from_env()` to load from environment variables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Scheduler configuration.
    pub scheduler: SchedulerConfig,

    /// Logging configuration.
    pub log: LogConfig,

    /// Runtime flags configuration.
    pub flags: FlagsConfig,
}

impl RuntimeConfig {
    /// Create a new builder for RuntimeConfig.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Variables that are not set use default values. Values that cannot be
    /// parsed are reported with a warning and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(val) = parse_env_usize("STRAND_NUM_WORKERS") {
            if val > 0 {
                config.scheduler.num_workers = val;
            }
        }

        if let Some(val) = parse_env_usize("STRAND_MAX_OPS_BEFORE_YIELD") {
            if val > 0 {
                config.scheduler.max_ops_before_yield = val;
            }
        }

        if let Ok(val) = env::var("STRAND_LOG_LEVEL") {
            match LogLevel::parse(&val) {
                Some(level) => config.log.level = level,
                None => tracing::warn!(var = "STRAND_LOG_LEVEL", value = %val, "ignoring invalid log level"),
            }
        }

        if let Some(val) = parse_env_bool("STRAND_INTERRUPTION") {
            config.flags.interruption = val;
        }

        if let Some(val) = parse_env_bool("STRAND_COOPERATIVE_YIELDING") {
            config.flags.cooperative_yielding = val;
        }

        config
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.num_workers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scheduler.num_workers".into(),
                message: "must be at least 1".into(),
            });
        }

        if self.scheduler.max_ops_before_yield == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scheduler.max_ops_before_yield".into(),
                message: "must be at least 1".into(),
            });
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },
    /// Environment variable parse error.
    #[error("failed to parse environment variable '{var}': {message}")]
    EnvParseError {
        /// Variable name.
        var: String,
        /// Error message.
        message: String,
    },
}

/// Builder for RuntimeConfig.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of worker threads.
    pub fn num_workers(mut self, n: usize) -> Self {
        self.config.scheduler.num_workers = n;
        self
    }

    /// Set the step budget of fibers.
    pub fn max_ops_before_yield(mut self, ops: usize) -> Self {
        self.config.scheduler.max_ops_before_yield = ops;
        self
    }

    /// Set the minimum log level.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log.level = level;
        self
    }

    /// Enable or disable interruption of root fibers.
    pub fn interruption(mut self, enabled: bool) -> Self {
        self.config.flags.interruption = enabled;
        self
    }

    /// Enable or disable cooperative yielding.
    pub fn cooperative_yielding(mut self, enabled: bool) -> Self {
        self.config.flags.cooperative_yielding = enabled;
        self
    }

    /// Build the configuration, validating it first.
    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the configuration without validation.
    ///
    /// Use this only if you're certain the configuration is valid.
    pub fn build_unchecked(self) -> RuntimeConfig {
        self.config
    }
}

/// Parse an environment variable as usize.
fn parse_env_usize(name: &str) -> Option<usize> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(val) => Some(val),
        Err(err) => {
            let error = ConfigError::EnvParseError {
                var: name.to_string(),
                message: format!("{}", err),
            };
            tracing::warn!(%error, "ignoring environment variable");
            None
        }
    }
}

/// Parse an environment variable as bool.
fn parse_env_bool(name: &str) -> Option<bool> {
    let raw = env::var(name).ok()?;
    let parsed = parse_bool(&raw);
    if parsed.is_none() {
        let error = ConfigError::EnvParseError {
            var: name.to_string(),
            message: format!("expected a boolean, got {:?}", raw),
        };
        tracing::warn!(%error, "ignoring environment variable");
    }
    parsed
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Get the number of available CPUs.
fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
