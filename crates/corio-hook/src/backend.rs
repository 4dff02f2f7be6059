//! Pluggable I/O backends
//!
//! Code that wants blocking-style I/O picks a backend at the call site:
//!
//! - `DirectIo`: plain libc calls, blocks the OS thread
//! - `CooperativeIo`: the hooked calls, suspends the fiber instead
//!
//! Both report failures as `std::io::Error` built from `errno`.

use crate::syscall;
use libc::{c_int, sockaddr, socklen_t};
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

#[inline]
fn cvt(n: isize) -> io::Result<usize> {
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

#[inline]
fn cvt_fd(n: c_int) -> io::Result<RawFd> {
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n)
    }
}

/// Blocking-style socket operations
pub trait IoBackend: Send + Sync + Clone + Default + 'static {
    fn socket(&self, domain: c_int, ty: c_int, protocol: c_int) -> io::Result<RawFd>;

    /// # Safety
    ///
    /// `addr` must point to a valid socket address of `len` bytes.
    unsafe fn connect(&self, fd: RawFd, addr: *const sockaddr, len: socklen_t) -> io::Result<()>;

    /// # Safety
    ///
    /// `addr`/`len` must be null or valid for writes, as for `accept(2)`.
    unsafe fn accept(&self, fd: RawFd, addr: *mut sockaddr, len: *mut socklen_t) -> io::Result<RawFd>;

    fn read(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&self, fd: RawFd, buf: &[u8]) -> io::Result<usize>;
    fn close(&self, fd: RawFd) -> io::Result<()>;
    fn sleep(&self, dur: Duration);
}

/// Straight libc calls
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectIo;

impl IoBackend for DirectIo {
    fn socket(&self, domain: c_int, ty: c_int, protocol: c_int) -> io::Result<RawFd> {
        cvt_fd(unsafe { libc::socket(domain, ty, protocol) })
    }

    unsafe fn connect(&self, fd: RawFd, addr: *const sockaddr, len: socklen_t) -> io::Result<()> {
        cvt_fd(libc::connect(fd, addr, len)).map(drop)
    }

    unsafe fn accept(&self, fd: RawFd, addr: *mut sockaddr, len: *mut socklen_t) -> io::Result<RawFd> {
        cvt_fd(libc::accept4(fd, addr, len, libc::SOCK_CLOEXEC))
    }

    fn read(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        cvt(unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) })
    }

    fn write(&self, fd: RawFd, buf: &[u8]) -> io::Result<usize> {
        cvt(unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) })
    }

    fn close(&self, fd: RawFd) -> io::Result<()> {
        cvt_fd(unsafe { libc::close(fd) }).map(drop)
    }

    fn sleep(&self, dur: Duration) {
        std::thread::sleep(dur);
    }
}

/// Hooked calls: suspend the fiber on a would-block
#[derive(Debug, Clone, Copy, Default)]
pub struct CooperativeIo;

impl IoBackend for CooperativeIo {
    fn socket(&self, domain: c_int, ty: c_int, protocol: c_int) -> io::Result<RawFd> {
        cvt_fd(syscall::socket(domain, ty, protocol))
    }

    unsafe fn connect(&self, fd: RawFd, addr: *const sockaddr, len: socklen_t) -> io::Result<()> {
        cvt_fd(syscall::connect(fd, addr, len)).map(drop)
    }

    unsafe fn accept(&self, fd: RawFd, addr: *mut sockaddr, len: *mut socklen_t) -> io::Result<RawFd> {
        cvt_fd(syscall::accept4(fd, addr, len, libc::SOCK_CLOEXEC))
    }

    fn read(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        cvt(syscall::read(fd, buf))
    }

    fn write(&self, fd: RawFd, buf: &[u8]) -> io::Result<usize> {
        cvt(syscall::write(fd, buf))
    }

    fn close(&self, fd: RawFd) -> io::Result<()> {
        cvt_fd(syscall::close(fd)).map(drop)
    }

    fn sleep(&self, dur: Duration) {
        let ms = dur.as_millis().min(u128::from(u64::MAX)) as u64;
        let req = libc::timespec {
            tv_sec: (ms / 1000) as libc::time_t,
            tv_nsec: ((ms % 1000) * 1_000_000) as libc::c_long,
        };
        syscall::nanosleep(&req, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::fcntl::OFlag;
    use std::os::fd::IntoRawFd;
    use std::time::Instant;

    fn pipe() -> (RawFd, RawFd) {
        let (rx, tx) = nix::unistd::pipe2(OFlag::O_CLOEXEC).unwrap();
        (rx.into_raw_fd(), tx.into_raw_fd())
    }

    fn roundtrip<B: IoBackend>(backend: B) {
        let (rx, tx) = pipe();
        assert_eq!(backend.write(tx, b"abc").unwrap(), 3);
        let mut buf = [0u8; 8];
        assert_eq!(backend.read(rx, &mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"abc");
        backend.close(tx).unwrap();
        // EOF once the writer is gone
        assert_eq!(backend.read(rx, &mut buf).unwrap(), 0);
        backend.close(rx).unwrap();
    }

    #[test]
    fn test_direct_roundtrip() {
        roundtrip(DirectIo);
    }

    #[test]
    fn test_cooperative_outside_fiber_behaves_like_direct() {
        roundtrip(CooperativeIo);
        let start = Instant::now();
        CooperativeIo.sleep(Duration::from_millis(15));
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_errors_carry_errno() {
        let err = DirectIo.close(-1).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
        let mut buf = [0u8; 1];
        let err = CooperativeIo.read(-1, &mut buf).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
    }
}
