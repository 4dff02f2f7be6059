//! # corio-core
//!
//! Core types for the corio fiber runtime.
//!
//! This crate is platform-agnostic and contains no context-switching or
//! event-loop code. All of that lives in `corio-runtime`.
//!
//! ## Modules
//!
//! - `id` - Fiber identifier type
//! - `state` - Fiber state machine
//! - `event` - Read/write interest mask
//! - `error` - Error types
//! - `kprint` - Kernel-style leveled logging macros
//! - `env` - Environment variable utilities
//! - `config_var` - Named configuration variables with change listeners

pub mod id;
pub mod state;
pub mod event;
pub mod error;
pub mod kprint;
pub mod env;
pub mod config_var;

// Re-exports for convenience
pub use id::FiberId;
pub use state::FiberState;
pub use event::Event;
pub use error::{ConfigError, RuntimeError, RuntimeResult};
pub use config_var::ConfigVar;
pub use env::{env_get, env_get_bool, env_get_opt, env_get_str};

/// Runtime-wide constants
pub mod constants {
    /// Default usable stack size for a task fiber (128 KB)
    pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

    /// Smallest stack a fiber may be created with
    pub const MIN_STACK_SIZE: usize = 16 * 1024;

    /// Guard page below every fiber stack
    pub const GUARD_SIZE: usize = 4096;

    /// Upper bound on a single readiness wait, in milliseconds
    pub const MAX_IDLE_WAIT_MS: u64 = 5000;

    /// Readiness events fetched per `epoll_wait`
    pub const MAX_EVENTS: usize = 256;

    /// Initial number of descriptor slots in the reactor table
    pub const INITIAL_FD_SLOTS: usize = 32;

    /// A backwards clock jump larger than this expires every timer
    pub const CLOCK_ROLLBACK_MS: u64 = 60 * 60 * 1000;

    /// Default connect timeout for the hook layer, in milliseconds
    pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;
}
