//! # corio-hook: blocking-style I/O that frees the worker
//!
//! Fibers call what look like ordinary blocking syscalls. When the call
//! would block, the fiber parks on the thread's reactor and the worker
//! goes on running other fibers, the same trick Go's netpoller plays.
//!
//! ## Layers
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │  net::TcpListener / net::TcpStream            │  std-like types
//! ├───────────────────────────────────────────────┤
//! │  backend::IoBackend (DirectIo | CooperativeIo)│  pick at call site
//! ├───────────────────────────────────────────────┤
//! │  syscall::*  (read, write, accept, sleep, …)  │  libc contract
//! ├───────────────────────────────────────────────┤
//! │  fd_registry::FdRegistry                      │  per-fd state
//! └──────────────────────┬────────────────────────┘
//!                        ▼
//!            corio_runtime::Reactor (epoll + timers)
//! ```
//!
//! Hooking is per thread: workers turn it on while they run fibers, every
//! other thread gets plain libc behavior from the same functions.

pub mod backend;
pub mod fd_registry;
pub mod net;
pub mod syscall;

pub use backend::{CooperativeIo, DirectIo, IoBackend};
pub use fd_registry::{FdCtx, FdRegistry, TimeoutKind};
pub use net::{TcpListener, TcpStream};
pub use syscall::{connect_timeout_var, is_hook_enabled, set_hook_enabled, CONNECT_TIMEOUT_VAR};
