//! Error types for the corio runtime
//!
//! Only externally triggerable failures are represented here. Broken
//! runtime invariants never become an `Err`; they go through `kfatal!`.

use thiserror::Error;

/// Result type for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors that can occur in runtime operations
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// `start()` called twice
    #[error("scheduler already started")]
    AlreadyStarted,

    /// `start()` after `stop()`, or work submitted once the workers are joined
    #[error("scheduler is stopping")]
    Stopping,

    /// Task pinned to a worker index the scheduler does not have
    #[error("worker {worker} out of range, scheduler has {threads}")]
    InvalidWorker { worker: usize, threads: usize },

    /// Operation needs to suspend but the caller is not a task fiber
    #[error("not running inside a task fiber")]
    NotInFiber,

    /// No scheduler is bound to the calling thread
    #[error("no scheduler on this thread")]
    NoScheduler,

    /// Worker thread could not be created
    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),

    /// Underlying system call failed
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl RuntimeError {
    /// Capture `errno` of the last failed system call
    #[inline]
    pub fn last_os_error() -> Self {
        RuntimeError::Io(std::io::Error::last_os_error())
    }

    /// Raw OS error code, if this error came from a system call
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            RuntimeError::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid config value: {0}")]
    InvalidValue(&'static str),

    #[error("invalid config name: {0:?}")]
    InvalidName(String),

    #[error("config {name:?} exists with a different type")]
    TypeMismatch { name: String },

    #[error("cannot parse {value:?} for config {name:?}")]
    Parse { name: String, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(RuntimeError::AlreadyStarted.to_string(), "scheduler already started");
        let e: RuntimeError = ConfigError::InvalidValue("threads must be > 0").into();
        assert_eq!(e.to_string(), "invalid config value: threads must be > 0");
        let e = RuntimeError::InvalidWorker { worker: 7, threads: 2 };
        assert_eq!(e.to_string(), "worker 7 out of range, scheduler has 2");
    }

    #[test]
    fn test_raw_os_error() {
        let e: RuntimeError = std::io::Error::from_raw_os_error(9).into();
        assert_eq!(e.raw_os_error(), Some(9));
        assert_eq!(RuntimeError::NoScheduler.raw_os_error(), None);
    }
}
