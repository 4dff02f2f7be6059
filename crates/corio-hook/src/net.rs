//! # TCP over a pluggable backend
//!
//! `TcpListener` and `TcpStream` own a raw descriptor and route every
//! potentially blocking call through an `IoBackend`. With the default
//! `CooperativeIo` backend, code written in plain blocking style runs
//! one connection per fiber:
//!
//! ```ignore
//! let listener = TcpListener::bind("127.0.0.1:8080".parse()?)?;
//! loop {
//!     let stream = listener.accept()?;
//!     corio::spawn(move || handle(stream));
//! }
//! ```
//!
//! Sockets must be created on a worker thread (hooking enabled) for the
//! cooperative path to take effect; elsewhere the calls simply block.

use crate::backend::{CooperativeIo, IoBackend};
use corio_core::kdebug;
use libc::{c_int, sockaddr, sockaddr_in, socklen_t};
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::RawFd;

fn to_sockaddr(addr: &SocketAddrV4) -> sockaddr_in {
    let mut sa: sockaddr_in = unsafe { std::mem::zeroed() };
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_port = addr.port().to_be();
    sa.sin_addr.s_addr = u32::from(*addr.ip()).to_be();
    sa
}

fn from_sockaddr(sa: &sockaddr_in) -> SocketAddrV4 {
    SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr)),
        u16::from_be(sa.sin_port),
    )
}

fn set_int_opt(fd: RawFd, level: c_int, name: c_int, value: c_int) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const c_int as *const libc::c_void,
            std::mem::size_of::<c_int>() as socklen_t,
        )
    };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn local_addr_of(fd: RawFd) -> io::Result<SocketAddrV4> {
    let mut sa: sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<sockaddr_in>() as socklen_t;
    let ret = unsafe { libc::getsockname(fd, &mut sa as *mut sockaddr_in as *mut sockaddr, &mut len) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(from_sockaddr(&sa))
}

/// A listening IPv4 TCP socket
pub struct TcpListener<B: IoBackend = CooperativeIo> {
    fd: RawFd,
    backend: B,
}

impl TcpListener<CooperativeIo> {
    /// Bind and listen using the cooperative backend
    pub fn bind(addr: SocketAddrV4) -> io::Result<Self> {
        Self::bind_with(CooperativeIo, addr)
    }
}

impl<B: IoBackend> TcpListener<B> {
    /// Create, set `SO_REUSEADDR`, bind and listen
    pub fn bind_with(backend: B, addr: SocketAddrV4) -> io::Result<Self> {
        let fd = backend.socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0)?;
        // owned from here on so every error path closes it
        let listener = Self { fd, backend };

        set_int_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;
        let sa = to_sockaddr(&addr);
        let ret = unsafe {
            libc::bind(
                fd,
                &sa as *const sockaddr_in as *const sockaddr,
                std::mem::size_of::<sockaddr_in>() as socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::listen(fd, 1024) } < 0 {
            return Err(io::Error::last_os_error());
        }
        kdebug!("listening on {} (fd {})", addr, fd);
        Ok(listener)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddrV4> {
        local_addr_of(self.fd)
    }

    /// Wait for the next connection
    pub fn accept(&self) -> io::Result<(TcpStream<B>, SocketAddrV4)> {
        let mut sa: sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<sockaddr_in>() as socklen_t;
        let fd = unsafe {
            self.backend
                .accept(self.fd, &mut sa as *mut sockaddr_in as *mut sockaddr, &mut len)?
        };
        let stream = TcpStream {
            fd,
            backend: self.backend.clone(),
        };
        // latency over throughput for small request/response traffic
        set_int_opt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1)?;
        Ok((stream, from_sockaddr(&sa)))
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

impl<B: IoBackend> Drop for TcpListener<B> {
    fn drop(&mut self) {
        let _ = self.backend.close(self.fd);
    }
}

/// A connected IPv4 TCP socket
pub struct TcpStream<B: IoBackend = CooperativeIo> {
    fd: RawFd,
    backend: B,
}

impl TcpStream<CooperativeIo> {
    /// Connect using the cooperative backend, bounded by `tcp.connect.timeout`
    pub fn connect(addr: SocketAddrV4) -> io::Result<Self> {
        Self::connect_with(CooperativeIo, addr)
    }
}

impl<B: IoBackend> TcpStream<B> {
    pub fn connect_with(backend: B, addr: SocketAddrV4) -> io::Result<Self> {
        let fd = backend.socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0)?;
        let stream = Self { fd, backend };
        let sa = to_sockaddr(&addr);
        unsafe {
            stream.backend.connect(
                fd,
                &sa as *const sockaddr_in as *const sockaddr,
                std::mem::size_of::<sockaddr_in>() as socklen_t,
            )?;
        }
        Ok(stream)
    }

    /// Read what is available, 0 at end of stream
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.backend.read(self.fd, buf)
    }

    /// One write call; may be short
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.backend.write(self.fd, buf)
    }

    pub fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match self.write(buf) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub fn local_addr(&self) -> io::Result<SocketAddrV4> {
        local_addr_of(self.fd)
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

impl<B: IoBackend> io::Read for TcpStream<B> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        TcpStream::read(self, buf)
    }
}

impl<B: IoBackend> io::Write for TcpStream<B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        TcpStream::write(self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<B: IoBackend> Drop for TcpStream<B> {
    fn drop(&mut self) {
        let _ = self.backend.close(self.fd);
    }
}
