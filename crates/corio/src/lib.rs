//! # corio - fibers on epoll
//!
//! Stackful fibers multiplexed over a pool of worker threads, with an
//! epoll reactor and a timer set underneath. Code inside a fiber is
//! written in plain blocking style; sleeps and socket calls suspend the
//! fiber, not the thread.
//!
//! ## Quick Start
//!
//! ```ignore
//! use corio::{Runtime, SchedulerConfig, spawn, sleep};
//! use std::time::Duration;
//!
//! fn main() {
//!     let rt = Runtime::new(SchedulerConfig::from_env().threads(4)).unwrap();
//!     rt.block_on(|| {
//!         for i in 0..3 {
//!             spawn(move || {
//!                 sleep(Duration::from_millis(10 * i));
//!                 println!("fiber {} done", i);
//!             })
//!             .unwrap();
//!         }
//!     })
//!     .unwrap();
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       User Code                          │
//! │        spawn(), yield_now(), sleep(), TcpStream          │
//! └──────────────────────────┬───────────────────────────────┘
//!                            ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                 corio-hook (syscall layer)               │
//! │       would block? ──► register interest, yield          │
//! └──────────────────────────┬───────────────────────────────┘
//!                            ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │            Scheduler  (FIFO queue, N workers)            │
//! └──────────┬──────────────────────────────────┬────────────┘
//!            ▼                                  ▼
//!    ┌──────────────┐                  ┌──────────────────┐
//!    │   Workers    │ ◄── idle in ───► │ Reactor          │
//!    │  run fibers  │                  │ epoll + timers   │
//!    └──────────────┘                  └──────────────────┘
//! ```

// Re-export core types
pub use corio_core::{
    ConfigError, ConfigVar, Event, FiberId, FiberState, RuntimeError, RuntimeResult,
};
pub use corio_core::config_var;

// Re-export kprint macros for debug logging
pub use corio_core::{kdebug, kerror, kfatal, kinfo, klog, kprint, kprintln, ktrace, kwarn};
pub use corio_core::kprint::{init as init_logging, set_flush_enabled, set_log_level, LogLevel};

// Re-export env utilities
pub use corio_core::{env_get, env_get_bool, env_get_opt, env_get_str};

// Re-export runtime types
pub use corio_runtime::{
    BaseDriver, Driver, EventCallback, Fiber, IoManager, Reactor, Scheduler, SchedulerConfig, Task,
    Timer, TimerManager,
};

// Hook layer
pub use corio_hook::{net, syscall, CooperativeIo, DirectIo, IoBackend, TcpListener, TcpStream};

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// An `IoManager` owned by the thread that drives it
///
/// With `use_caller` (the default) the creating thread is one of the
/// workers, so `block_on` and drop must happen on that thread.
pub struct Runtime {
    iom: IoManager,
}

impl Runtime {
    /// Start an I/O scheduler with the given configuration
    pub fn new(config: SchedulerConfig) -> RuntimeResult<Self> {
        Ok(Self {
            iom: IoManager::new(config)?,
        })
    }

    /// Run `f` as a fiber, wait for it and everything it spawned, then shut down
    pub fn block_on<F, T>(self, f: F) -> RuntimeResult<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let slot = Arc::new(Mutex::new(None));
        let out = slot.clone();
        self.iom.schedule(move || {
            *out.lock() = Some(f());
        });
        self.iom.stop();

        let result = slot.lock().take();
        result.ok_or(RuntimeError::Stopping)
    }

    /// Queue `f` on this runtime from any thread
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.iom.schedule(f);
    }

    #[inline]
    pub fn io_manager(&self) -> &IoManager {
        &self.iom
    }

    /// Wait for outstanding work and join the workers
    pub fn shutdown(self) {
        self.iom.stop();
    }
}

/// Spawn a fiber on the scheduler the caller runs under
///
/// Fails with `NoScheduler` outside a worker thread.
pub fn spawn<F>(f: F) -> RuntimeResult<()>
where
    F: FnOnce() + Send + 'static,
{
    let sched = Scheduler::current().ok_or(RuntimeError::NoScheduler)?;
    sched.schedule(f);
    Ok(())
}

/// Yield execution to the scheduler
///
/// The current fiber goes to the back of the queue. Outside a fiber
/// this yields the OS thread.
#[inline]
pub fn yield_now() {
    corio_runtime::yield_now()
}

/// Suspend the calling fiber for `dur`; blocks the thread outside the runtime
#[inline]
pub fn sleep(dur: Duration) {
    CooperativeIo.sleep(dur)
}

#[inline]
pub fn sleep_ms(ms: u64) {
    sleep(Duration::from_millis(ms))
}

/// Id of the fiber running on this thread
#[inline]
pub fn current_id() -> FiberId {
    Fiber::current_id()
}

/// Check if currently executing within a task fiber
#[inline]
pub fn is_in_fiber() -> bool {
    Fiber::in_task_fiber()
}
