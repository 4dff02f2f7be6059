//! # corio-runtime
//!
//! Linux runtime for corio fibers.
//!
//! This crate provides:
//! - Stackful fibers (mmap'd stacks, assembly context switch)
//! - An M:N scheduler over a pool of worker threads
//! - A deadline-ordered timer manager
//! - The epoll reactor and `IoManager`
//! - Per-thread runtime context

pub mod arch;
pub mod config;
pub mod fiber;
pub mod io;
pub mod scheduler;
pub mod stack;
pub mod timer;
pub mod tls;
pub mod worker;

// Re-exports
pub use config::SchedulerConfig;
pub use fiber::{Fiber, FiberFn};
pub use io::{EventCallback, FdContext, IoManager, Reactor};
pub use scheduler::{yield_now, BaseDriver, Driver, Scheduler, Task};
pub use timer::{Clock, ManualClock, MonotonicClock, Timer, TimerCallback, TimerManager};
pub use worker::WorkerPool;

#[cfg(not(target_os = "linux"))]
compile_error!("corio-runtime needs epoll and only builds on Linux");
