//! # Hooked system calls
//!
//! Drop-in versions of the blocking socket, descriptor and sleep calls.
//! They keep the libc contract (return value, `-1` + `errno`), but on a
//! worker thread with hooking enabled a call that would block suspends
//! the calling fiber instead of the thread:
//!
//! ```text
//!   attempt call ──► EAGAIN ──► add_event(fd) ──► [timeout timer] ──► yield
//!        ▲                                                              │
//!        └──────────────── readiness: retry ◄───────────────────────────┤
//!                          timer fired: -1 / ETIMEDOUT ◄────────────────┘
//! ```
//!
//! A call falls straight through to libc when hooking is off for the
//! thread, the caller is not on a task fiber of an I/O scheduler, the
//! descriptor is unknown or not pollable, or the application put it in
//! non-blocking mode itself.

use crate::fd_registry::{FdRegistry, TimeoutKind};
use corio_core::config_var::{self, ConfigVar};
use corio_core::constants::DEFAULT_CONNECT_TIMEOUT_MS;
use corio_core::{kerror, kinfo, ktrace, Event};
use corio_runtime::tls;
use corio_runtime::{Fiber, Reactor, Scheduler};
use libc::{c_int, c_uint, c_ulong, c_void, msghdr, size_t, sockaddr, socklen_t, ssize_t};
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Name of the connect-timeout configuration variable (milliseconds)
pub const CONNECT_TIMEOUT_VAR: &str = "tcp.connect.timeout";

static CONNECT_TIMEOUT_MS: AtomicU64 = AtomicU64::new(DEFAULT_CONNECT_TIMEOUT_MS);

/// The `tcp.connect.timeout` variable, registered on first use.
///
/// `u64::MAX` disables the timeout.
pub fn connect_timeout_var() -> Option<Arc<ConfigVar<u64>>> {
    static VAR: OnceLock<Option<Arc<ConfigVar<u64>>>> = OnceLock::new();
    VAR.get_or_init(|| {
        match config_var::lookup(CONNECT_TIMEOUT_VAR, DEFAULT_CONNECT_TIMEOUT_MS, "tcp connect timeout (ms)") {
            Ok(var) => {
                CONNECT_TIMEOUT_MS.store(var.value(), Ordering::Release);
                var.add_listener(|old, new| {
                    kinfo!("tcp connect timeout changed from {} to {}", old, new);
                    CONNECT_TIMEOUT_MS.store(*new, Ordering::Release);
                });
                Some(var)
            }
            Err(e) => {
                kerror!("{} not registered: {}", CONNECT_TIMEOUT_VAR, e);
                None
            }
        }
    })
    .clone()
}

fn connect_timeout() -> Option<u64> {
    let _ = connect_timeout_var();
    let ms = CONNECT_TIMEOUT_MS.load(Ordering::Acquire);
    (ms != u64::MAX).then_some(ms)
}

#[inline]
pub fn errno() -> c_int {
    unsafe { *libc::__errno_location() }
}

#[inline]
pub fn set_errno(e: c_int) {
    unsafe { *libc::__errno_location() = e };
}

pub use corio_runtime::tls::{is_hook_enabled, set_hook_enabled};

/// Reactor to wait on, if the caller may suspend at all
fn cooperative_reactor() -> Option<Arc<Reactor>> {
    if !tls::is_hook_enabled() || !Fiber::in_task_fiber() {
        return None;
    }
    Reactor::current()
}

/// Suspend the calling fiber until `event` fires on `fd` or `timeout`
/// elapses. Returns the errno to report, 0 when the event fired.
fn wait_for(reactor: &Arc<Reactor>, fd: RawFd, event: Event, timeout: Option<u64>, name: &str) -> c_int {
    // holds the errno a timeout leaves behind; the timer only acts while it lives
    let cancelled = Arc::new(AtomicI32::new(0));

    if let Err(e) = reactor.add_event(fd, event, None) {
        kerror!("{}: add_event(fd {}, {:?}) failed: {}", name, fd, event, e);
        return e.raw_os_error().unwrap_or(libc::EIO);
    }

    let timer = timeout.map(|ms| {
        let flag = Arc::downgrade(&cancelled);
        let weak_reactor = Arc::downgrade(reactor);
        reactor.add_condition_timer(
            ms,
            move || {
                let (Some(flag), Some(reactor)) = (flag.upgrade(), weak_reactor.upgrade()) else {
                    return;
                };
                reactor.cancel_event_with(fd, event, || flag.store(libc::ETIMEDOUT, Ordering::Release));
            },
            Arc::downgrade(&cancelled),
            false,
        )
    });

    Fiber::yield_now();

    if let Some(timer) = timer {
        timer.cancel();
    }
    cancelled.load(Ordering::Acquire)
}

/// Retry wrapper shared by every read/write style call
fn do_io<F>(fd: RawFd, name: &str, event: Event, kind: TimeoutKind, mut op: F) -> ssize_t
where
    F: FnMut() -> ssize_t,
{
    let Some(reactor) = cooperative_reactor() else {
        return op();
    };
    let Some(ctx) = FdRegistry::global().get(fd, false) else {
        return op();
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_pollable() || ctx.user_nonblock() {
        return op();
    }

    let timeout = ctx.timeout(kind);
    loop {
        let mut n = op();
        while n == -1 && errno() == libc::EINTR {
            n = op();
        }
        if n != -1 || errno() != libc::EAGAIN {
            return n;
        }

        ktrace!("{} on fd {} would block", name, fd);
        let err = wait_for(&reactor, fd, event, timeout, name);
        if err != 0 {
            set_errno(err);
            return -1;
        }
    }
}

// ── sleep family ──

fn sleep_for(ms: u64) {
    let Some(reactor) = cooperative_reactor() else {
        std::thread::sleep(Duration::from_millis(ms));
        return;
    };
    let Some(sched) = Scheduler::current() else {
        std::thread::sleep(Duration::from_millis(ms));
        return;
    };
    let fiber = Fiber::current();
    let sched = Arc::downgrade(&sched);
    reactor.add_timer(
        ms,
        move || {
            if let Some(sched) = sched.upgrade() {
                sched.schedule_fiber(fiber.clone());
            }
        },
        false,
    );
    Fiber::yield_now();
}

/// Sleep the calling fiber; always returns 0
pub fn sleep(seconds: c_uint) -> c_uint {
    sleep_for(u64::from(seconds) * 1000);
    0
}

/// Millisecond resolution: sub-millisecond parts are dropped
pub fn usleep(usec: libc::useconds_t) -> c_int {
    sleep_for(u64::from(usec) / 1000);
    0
}

pub fn nanosleep(req: &libc::timespec, rem: Option<&mut libc::timespec>) -> c_int {
    if req.tv_sec < 0 || !(0..1_000_000_000).contains(&req.tv_nsec) {
        set_errno(libc::EINVAL);
        return -1;
    }
    let ms = (req.tv_sec as u64)
        .saturating_mul(1000)
        .saturating_add(req.tv_nsec as u64 / 1_000_000);
    sleep_for(ms);
    if let Some(rem) = rem {
        rem.tv_sec = 0;
        rem.tv_nsec = 0;
    }
    0
}

// ── socket lifecycle ──

pub fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if fd >= 0 && tls::is_hook_enabled() {
        FdRegistry::global().get(fd, true);
    }
    fd
}

/// `connect` with an explicit timeout (`None` waits forever)
///
/// # Safety
///
/// `addr` must point to a valid socket address of `len` bytes.
pub unsafe fn connect_with_timeout(fd: RawFd, addr: *const sockaddr, len: socklen_t, timeout_ms: Option<u64>) -> c_int {
    let Some(reactor) = cooperative_reactor() else {
        return libc::connect(fd, addr, len);
    };
    let Some(ctx) = FdRegistry::global().get(fd, false) else {
        return libc::connect(fd, addr, len);
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_pollable() || ctx.user_nonblock() {
        return libc::connect(fd, addr, len);
    }

    let n = libc::connect(fd, addr, len);
    if n == 0 {
        return 0;
    }
    if n != -1 || errno() != libc::EINPROGRESS {
        return n;
    }

    let err = wait_for(&reactor, fd, Event::WRITE, timeout_ms, "connect");
    if err != 0 {
        set_errno(err);
        return -1;
    }

    let mut so_error: c_int = 0;
    let mut optlen = std::mem::size_of::<c_int>() as socklen_t;
    if libc::getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut so_error as *mut c_int as *mut c_void,
        &mut optlen,
    ) == -1
    {
        return -1;
    }
    if so_error != 0 {
        set_errno(so_error);
        return -1;
    }
    0
}

/// `connect` bounded by `tcp.connect.timeout`
///
/// # Safety
///
/// `addr` must point to a valid socket address of `len` bytes.
pub unsafe fn connect(fd: RawFd, addr: *const sockaddr, len: socklen_t) -> c_int {
    connect_with_timeout(fd, addr, len, connect_timeout())
}

/// # Safety
///
/// `addr` and `len` must be null or valid for writes, as for `accept(2)`.
pub unsafe fn accept4(fd: RawFd, addr: *mut sockaddr, len: *mut socklen_t, flags: c_int) -> c_int {
    let n = do_io(fd, "accept", Event::READ, TimeoutKind::Recv, || {
        libc::accept4(fd, addr, len, flags) as ssize_t
    }) as c_int;
    if n >= 0 && tls::is_hook_enabled() {
        FdRegistry::global().get(n, true);
    }
    n
}

/// # Safety
///
/// `addr` and `len` must be null or valid for writes, as for `accept(2)`.
pub unsafe fn accept(fd: RawFd, addr: *mut sockaddr, len: *mut socklen_t) -> c_int {
    accept4(fd, addr, len, 0)
}

/// Close `fd`, waking every fiber still waiting on it
pub fn close(fd: RawFd) -> c_int {
    if tls::is_hook_enabled() {
        if let Some(ctx) = FdRegistry::global().get(fd, false) {
            ctx.mark_closed();
            if let Some(reactor) = Reactor::current() {
                reactor.cancel_all(fd);
            }
        }
    }
    FdRegistry::global().del(fd);
    unsafe { libc::close(fd) }
}

// ── reads ──

pub fn read(fd: RawFd, buf: &mut [u8]) -> ssize_t {
    do_io(fd, "read", Event::READ, TimeoutKind::Recv, || unsafe {
        libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len())
    })
}

pub fn readv(fd: RawFd, bufs: &mut [IoSliceMut<'_>]) -> ssize_t {
    // IoSliceMut is ABI compatible with iovec
    do_io(fd, "readv", Event::READ, TimeoutKind::Recv, || unsafe {
        libc::readv(fd, bufs.as_ptr() as *const libc::iovec, bufs.len() as c_int)
    })
}

pub fn recv(fd: RawFd, buf: &mut [u8], flags: c_int) -> ssize_t {
    do_io(fd, "recv", Event::READ, TimeoutKind::Recv, || unsafe {
        libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), flags)
    })
}

/// # Safety
///
/// `src_addr` and `addrlen` must be null or valid for writes, as for `recvfrom(2)`.
pub unsafe fn recvfrom(
    fd: RawFd,
    buf: &mut [u8],
    flags: c_int,
    src_addr: *mut sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    do_io(fd, "recvfrom", Event::READ, TimeoutKind::Recv, || {
        libc::recvfrom(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), flags, src_addr, addrlen)
    })
}

/// # Safety
///
/// `msg` must describe valid buffers, as for `recvmsg(2)`.
pub unsafe fn recvmsg(fd: RawFd, msg: *mut msghdr, flags: c_int) -> ssize_t {
    do_io(fd, "recvmsg", Event::READ, TimeoutKind::Recv, || libc::recvmsg(fd, msg, flags))
}

// ── writes ──

pub fn write(fd: RawFd, buf: &[u8]) -> ssize_t {
    do_io(fd, "write", Event::WRITE, TimeoutKind::Send, || unsafe {
        libc::write(fd, buf.as_ptr() as *const c_void, buf.len())
    })
}

pub fn writev(fd: RawFd, bufs: &[IoSlice<'_>]) -> ssize_t {
    do_io(fd, "writev", Event::WRITE, TimeoutKind::Send, || unsafe {
        libc::writev(fd, bufs.as_ptr() as *const libc::iovec, bufs.len() as c_int)
    })
}

pub fn send(fd: RawFd, buf: &[u8], flags: c_int) -> ssize_t {
    do_io(fd, "send", Event::WRITE, TimeoutKind::Send, || unsafe {
        libc::send(fd, buf.as_ptr() as *const c_void, buf.len(), flags)
    })
}

/// # Safety
///
/// `dest_addr` must point to a valid socket address of `addrlen` bytes (or be null).
pub unsafe fn sendto(
    fd: RawFd,
    buf: &[u8],
    flags: c_int,
    dest_addr: *const sockaddr,
    addrlen: socklen_t,
) -> ssize_t {
    do_io(fd, "sendto", Event::WRITE, TimeoutKind::Send, || {
        libc::sendto(fd, buf.as_ptr() as *const c_void, buf.len() as size_t, flags, dest_addr, addrlen)
    })
}

/// # Safety
///
/// `msg` must describe valid buffers, as for `sendmsg(2)`.
pub unsafe fn sendmsg(fd: RawFd, msg: *const msghdr, flags: c_int) -> ssize_t {
    do_io(fd, "sendmsg", Event::WRITE, TimeoutKind::Send, || libc::sendmsg(fd, msg, flags))
}

// ── descriptor control ──

/// `fcntl` for integer-argument commands.
///
/// `F_SETFL`/`F_GETFL` on a registered pollable descriptor track the
/// application's `O_NONBLOCK` wish separately: the descriptor stays
/// non-blocking underneath, and `F_GETFL` reports what the application set.
pub fn fcntl(fd: RawFd, cmd: c_int, arg: c_int) -> c_int {
    let ctx = FdRegistry::global()
        .get(fd, false)
        .filter(|ctx| !ctx.is_closed() && ctx.is_pollable());
    match (cmd, ctx) {
        (libc::F_SETFL, Some(ctx)) => {
            ctx.set_user_nonblock(arg & libc::O_NONBLOCK != 0);
            let arg = if ctx.sys_nonblock() {
                arg | libc::O_NONBLOCK
            } else {
                arg & !libc::O_NONBLOCK
            };
            unsafe { libc::fcntl(fd, cmd, arg) }
        }
        (libc::F_GETFL, Some(ctx)) => {
            let flags = unsafe { libc::fcntl(fd, cmd) };
            if flags < 0 {
                return flags;
            }
            if ctx.user_nonblock() {
                flags | libc::O_NONBLOCK
            } else {
                flags & !libc::O_NONBLOCK
            }
        }
        _ => unsafe { libc::fcntl(fd, cmd, arg) },
    }
}

/// `ioctl`; `FIONBIO` updates the tracked non-blocking wish
///
/// # Safety
///
/// `arg` must be valid for `request`, as for `ioctl(2)`.
pub unsafe fn ioctl(fd: RawFd, request: c_ulong, arg: *mut c_void) -> c_int {
    if request == libc::FIONBIO as c_ulong && !arg.is_null() {
        let user_nonblock = *(arg as *const c_int) != 0;
        if let Some(ctx) = FdRegistry::global().get(fd, false) {
            if !ctx.is_closed() && ctx.is_pollable() {
                ctx.set_user_nonblock(user_nonblock);
            }
        }
    }
    libc::ioctl(fd, request as _, arg)
}

/// # Safety
///
/// As for `getsockopt(2)`.
pub unsafe fn getsockopt(
    fd: RawFd,
    level: c_int,
    optname: c_int,
    optval: *mut c_void,
    optlen: *mut socklen_t,
) -> c_int {
    libc::getsockopt(fd, level, optname, optval, optlen)
}

/// `setsockopt`; `SO_RCVTIMEO`/`SO_SNDTIMEO` also set the timeout the
/// cooperative path waits with (a zero timeval means no timeout)
///
/// # Safety
///
/// As for `setsockopt(2)`.
pub unsafe fn setsockopt(
    fd: RawFd,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> c_int {
    let kind = match optname {
        libc::SO_RCVTIMEO => Some(TimeoutKind::Recv),
        libc::SO_SNDTIMEO => Some(TimeoutKind::Send),
        _ => None,
    };
    if let (true, libc::SOL_SOCKET, Some(kind)) = (tls::is_hook_enabled(), level, kind) {
        if !optval.is_null() && optlen as usize >= std::mem::size_of::<libc::timeval>() {
            if let Some(ctx) = FdRegistry::global().get(fd, false) {
                let tv = &*(optval as *const libc::timeval);
                let ms = (tv.tv_sec.max(0) as u64) * 1000 + (tv.tv_usec.max(0) as u64) / 1000;
                ctx.set_timeout(kind, (ms > 0).then_some(ms));
            }
        }
    }
    libc::setsockopt(fd, level, optname, optval, optlen)
}
