//! Per-descriptor state for the hooked call surface
//!
//! The registry remembers, for every descriptor the hook layer has seen,
//! whether it can be waited on through epoll, whether the *runtime* put it
//! in non-blocking mode, whether the *user* asked for non-blocking mode,
//! and the receive/send timeouts set through `setsockopt`.
//!
//! Entries are created by the hooked `socket`/`accept` (or explicitly with
//! `get(fd, true)`) and removed by the hooked `close`.

use corio_core::kdebug;
use parking_lot::RwLock;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

const NO_TIMEOUT: u64 = u64::MAX;

/// Which direction a timeout applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// `SO_RCVTIMEO`: read, recv, accept
    Recv,
    /// `SO_SNDTIMEO`: write, send, connect
    Send,
}

/// State of one descriptor
#[derive(Debug)]
pub struct FdCtx {
    fd: RawFd,
    /// Socket or FIFO, i.e. something epoll can report on
    pollable: bool,
    sys_nonblock: bool,
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdCtx {
    fn new(fd: RawFd) -> Self {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        let valid = unsafe { libc::fstat(fd, &mut st) } == 0;
        let kind = st.st_mode & libc::S_IFMT;
        let pollable = valid && (kind == libc::S_IFSOCK || kind == libc::S_IFIFO);

        let mut sys_nonblock = false;
        if pollable {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
            if flags >= 0 {
                if flags & libc::O_NONBLOCK == 0 {
                    unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
                }
                sys_nonblock = true;
            }
        }

        Self {
            fd,
            pollable,
            sys_nonblock,
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(!valid),
            recv_timeout_ms: AtomicU64::new(NO_TIMEOUT),
            send_timeout_ms: AtomicU64::new(NO_TIMEOUT),
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn is_pollable(&self) -> bool {
        self.pollable
    }

    /// The runtime switched the descriptor to non-blocking mode
    #[inline]
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock
    }

    /// The application asked for non-blocking mode itself
    #[inline]
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    pub fn set_user_nonblock(&self, yes: bool) {
        self.user_nonblock.store(yes, Ordering::Release);
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Timeout in milliseconds, `None` for "wait forever"
    pub fn timeout(&self, kind: TimeoutKind) -> Option<u64> {
        let ms = match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.load(Ordering::Acquire),
            TimeoutKind::Send => self.send_timeout_ms.load(Ordering::Acquire),
        };
        (ms != NO_TIMEOUT).then_some(ms)
    }

    pub fn set_timeout(&self, kind: TimeoutKind, ms: Option<u64>) {
        let v = ms.unwrap_or(NO_TIMEOUT);
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.store(v, Ordering::Release),
            TimeoutKind::Send => self.send_timeout_ms.store(v, Ordering::Release),
        }
    }
}

/// Table of `FdCtx`, indexed by descriptor number
pub struct FdRegistry {
    slots: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

impl FdRegistry {
    fn new(initial: usize) -> Self {
        Self {
            slots: RwLock::new(vec![None; initial]),
        }
    }

    /// Process-wide registry
    pub fn global() -> &'static FdRegistry {
        static REGISTRY: OnceLock<FdRegistry> = OnceLock::new();
        REGISTRY.get_or_init(|| FdRegistry::new(64))
    }

    /// Context of `fd`, created on demand when `auto_create` is set
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdCtx>> {
        let idx = usize::try_from(fd).ok()?;
        {
            let slots = self.slots.read();
            match slots.get(idx) {
                Some(Some(ctx)) => return Some(ctx.clone()),
                _ if !auto_create => return None,
                _ => {}
            }
        }

        let mut slots = self.slots.write();
        if idx >= slots.len() {
            let grow_to = (idx * 3 / 2).max(idx + 1);
            slots.resize(grow_to, None);
        }
        let ctx = slots[idx].get_or_insert_with(|| {
            kdebug!("fd {} registered", fd);
            Arc::new(FdCtx::new(fd))
        });
        Some(ctx.clone())
    }

    /// Forget `fd`
    pub fn del(&self, fd: RawFd) {
        let Ok(idx) = usize::try_from(fd) else {
            return;
        };
        let mut slots = self.slots.write();
        if let Some(slot) = slots.get_mut(idx) {
            if let Some(ctx) = slot.take() {
                ctx.mark_closed();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::fcntl::OFlag;
    use std::os::fd::AsRawFd;

    #[test]
    fn test_pipe_becomes_pollable_and_nonblocking() {
        let registry = FdRegistry::new(4);
        let (rx, _tx) = nix::unistd::pipe2(OFlag::O_CLOEXEC).unwrap();
        let fd = rx.as_raw_fd();

        assert!(registry.get(fd, false).is_none());
        let ctx = registry.get(fd, true).unwrap();
        assert!(ctx.is_pollable());
        assert!(ctx.sys_nonblock());
        assert!(!ctx.user_nonblock());
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        assert_ne!(flags & libc::O_NONBLOCK, 0);

        // same context on the next lookup
        assert!(Arc::ptr_eq(&ctx, &registry.get(fd, true).unwrap()));
        registry.del(fd);
        assert!(ctx.is_closed());
        assert!(registry.get(fd, false).is_none());
    }

    #[test]
    fn test_regular_file_is_not_pollable() {
        let registry = FdRegistry::new(4);
        let file = std::fs::File::open("/proc/self/status").unwrap();
        let ctx = registry.get(file.as_raw_fd(), true).unwrap();
        assert!(!ctx.is_pollable());
        assert!(!ctx.sys_nonblock());
        registry.del(file.as_raw_fd());
    }

    #[test]
    fn test_timeouts() {
        let registry = FdRegistry::new(1);
        let (rx, _tx) = nix::unistd::pipe2(OFlag::O_CLOEXEC).unwrap();
        let ctx = registry.get(rx.as_raw_fd(), true).unwrap();
        assert_eq!(ctx.timeout(TimeoutKind::Recv), None);
        ctx.set_timeout(TimeoutKind::Recv, Some(250));
        assert_eq!(ctx.timeout(TimeoutKind::Recv), Some(250));
        assert_eq!(ctx.timeout(TimeoutKind::Send), None);
        ctx.set_timeout(TimeoutKind::Recv, None);
        assert_eq!(ctx.timeout(TimeoutKind::Recv), None);
    }

    #[test]
    fn test_negative_fd() {
        let registry = FdRegistry::new(1);
        assert!(registry.get(-1, true).is_none());
        registry.del(-1);
    }
}
