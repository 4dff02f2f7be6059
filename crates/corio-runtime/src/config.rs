//! Scheduler configuration
//!
//! Library defaults with runtime environment overrides.
//!
//! ```rust,ignore
//! use corio_runtime::config::SchedulerConfig;
//!
//! // Defaults + CORIO_* overrides
//! let config = SchedulerConfig::from_env();
//!
//! // Or customize programmatically
//! let config = SchedulerConfig::new()
//!     .threads(4)
//!     .use_caller(false)
//!     .name("io");
//! ```

use corio_core::constants;
use corio_core::env::{env_get, env_get_bool, env_get_str};
use corio_core::error::ConfigError;
use std::time::Duration;

/// Library defaults
pub mod defaults {
    use super::constants;

    pub const THREADS: usize = 1;
    pub const USE_CALLER: bool = true;
    pub const NAME: &str = "corio";
    pub const STACK_SIZE: usize = constants::DEFAULT_STACK_SIZE;
    pub const MAX_IDLE_WAIT_MS: u64 = constants::MAX_IDLE_WAIT_MS;
    pub const MAX_EVENTS: usize = constants::MAX_EVENTS;
    pub const INITIAL_FD_SLOTS: usize = constants::INITIAL_FD_SLOTS;

    /// Hard upper bound on worker threads
    pub const MAX_THREADS: usize = 256;
}

/// Scheduler configuration with builder pattern.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Total worker threads, including the caller when `use_caller` is set
    pub threads: usize,
    /// The constructing thread becomes worker 0 and drains the queue in `stop()`
    pub use_caller: bool,
    /// Scheduler name; workers are named `<name>_<index>`
    pub name: String,
    /// Usable stack bytes for task, idle and callback fibers
    pub stack_size: usize,
    /// Ceiling on one idle wait, bounds the latency of newly scheduled work
    pub max_idle_wait: Duration,
    /// Readiness events fetched per wait
    pub max_events: usize,
    /// Descriptor table size before the first growth
    pub initial_fd_slots: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerConfig {
    /// Library defaults, no environment lookups
    pub fn new() -> Self {
        Self {
            threads: defaults::THREADS,
            use_caller: defaults::USE_CALLER,
            name: defaults::NAME.to_string(),
            stack_size: defaults::STACK_SIZE,
            max_idle_wait: Duration::from_millis(defaults::MAX_IDLE_WAIT_MS),
            max_events: defaults::MAX_EVENTS,
            initial_fd_slots: defaults::INITIAL_FD_SLOTS,
        }
    }

    /// Defaults with environment overrides.
    ///
    /// - `CORIO_THREADS` - Total worker threads
    /// - `CORIO_USE_CALLER` - Include the constructing thread (0/1)
    /// - `CORIO_NAME` - Scheduler name
    /// - `CORIO_STACK_SIZE` - Fiber stack size in bytes
    /// - `CORIO_IDLE_WAIT_MS` - Readiness wait ceiling in milliseconds
    /// - `CORIO_MAX_EVENTS` - Events per readiness wait
    /// - `CORIO_FD_SLOTS` - Initial descriptor table size
    pub fn from_env() -> Self {
        Self {
            threads: env_get("CORIO_THREADS", defaults::THREADS),
            use_caller: env_get_bool("CORIO_USE_CALLER", defaults::USE_CALLER),
            name: env_get_str("CORIO_NAME", defaults::NAME),
            stack_size: env_get("CORIO_STACK_SIZE", defaults::STACK_SIZE),
            max_idle_wait: Duration::from_millis(env_get(
                "CORIO_IDLE_WAIT_MS",
                defaults::MAX_IDLE_WAIT_MS,
            )),
            max_events: env_get("CORIO_MAX_EVENTS", defaults::MAX_EVENTS),
            initial_fd_slots: env_get("CORIO_FD_SLOTS", defaults::INITIAL_FD_SLOTS),
        }
    }

    // Builder methods

    pub fn threads(mut self, n: usize) -> Self {
        self.threads = n;
        self
    }

    pub fn use_caller(mut self, yes: bool) -> Self {
        self.use_caller = yes;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    pub fn max_idle_wait(mut self, d: Duration) -> Self {
        self.max_idle_wait = d;
        self
    }

    pub fn max_events(mut self, n: usize) -> Self {
        self.max_events = n;
        self
    }

    pub fn initial_fd_slots(mut self, n: usize) -> Self {
        self.initial_fd_slots = n;
        self
    }

    /// Worker threads that `start()` must spawn
    pub fn spawned_threads(&self) -> usize {
        if self.use_caller {
            self.threads.saturating_sub(1)
        } else {
            self.threads
        }
    }

    /// Idle wait ceiling in whole milliseconds, at least 1
    pub(crate) fn idle_wait_ms(&self) -> u64 {
        (self.max_idle_wait.as_millis() as u64).max(1)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threads == 0 {
            return Err(ConfigError::InvalidValue("threads must be > 0"));
        }
        if self.threads > defaults::MAX_THREADS {
            return Err(ConfigError::InvalidValue("threads must be <= 256"));
        }
        if self.name.is_empty() {
            return Err(ConfigError::InvalidValue("name must not be empty"));
        }
        if self.stack_size < constants::MIN_STACK_SIZE {
            return Err(ConfigError::InvalidValue("stack_size must be >= 16KB"));
        }
        if self.max_idle_wait.is_zero() {
            return Err(ConfigError::InvalidValue("max_idle_wait must be > 0"));
        }
        if self.max_events == 0 {
            return Err(ConfigError::InvalidValue("max_events must be > 0"));
        }
        if self.initial_fd_slots == 0 {
            return Err(ConfigError::InvalidValue("initial_fd_slots must be > 0"));
        }
        Ok(())
    }

    /// Print configuration (for debugging)
    pub fn print(&self) {
        eprintln!("corio scheduler configuration:");
        eprintln!("  name:              {}", self.name);
        eprintln!("  threads:           {}", self.threads);
        eprintln!("  use_caller:        {}", self.use_caller);
        eprintln!("  stack_size:        {}", self.stack_size);
        eprintln!("  max_idle_wait:     {:?}", self.max_idle_wait);
        eprintln!("  max_events:        {}", self.max_events);
        eprintln!("  initial_fd_slots:  {}", self.initial_fd_slots);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = SchedulerConfig::new();
        assert_eq!(config.threads, 1);
        assert!(config.use_caller);
        assert_eq!(config.spawned_threads(), 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = SchedulerConfig::new()
            .threads(4)
            .use_caller(false)
            .name("io")
            .max_idle_wait(Duration::from_millis(50));

        assert_eq!(config.spawned_threads(), 4);
        assert_eq!(config.name, "io");
        assert_eq!(config.idle_wait_ms(), 50);
    }

    #[test]
    fn test_validation() {
        assert!(SchedulerConfig::new().threads(0).validate().is_err());
        assert!(SchedulerConfig::new().threads(1000).validate().is_err());
        assert!(SchedulerConfig::new().stack_size(1024).validate().is_err());
        assert!(SchedulerConfig::new().name("").validate().is_err());
    }

    #[test]
    fn test_from_env_override() {
        std::env::set_var("CORIO_MAX_EVENTS", "17");
        let config = SchedulerConfig::from_env();
        assert_eq!(config.max_events, 17);
        std::env::remove_var("CORIO_MAX_EVENTS");
    }
}
