//! I/O-capable scheduling
//!
//! - `fd_context` - Per-descriptor interest records
//! - `reactor` - epoll readiness loop, plugged into the scheduler as its driver
//! - `manager` - `IoManager`, a started scheduler + reactor pair

mod fd_context;
mod manager;
mod reactor;

pub use fd_context::{EventCallback, FdContext};
pub use manager::IoManager;
pub use reactor::Reactor;
