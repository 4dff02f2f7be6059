//! corio Echo Server
//!
//! TCP echo server with one fiber per connection. Every read, write and
//! accept is written as a blocking call; the hook layer parks the fiber
//! on the reactor instead of blocking the worker.
//!
//! Usage:
//!     cargo build --release -p corio-echo
//!     CORIO_THREADS=4 ./target/release/echo [port] [idle_timeout_ms]
//!
//! Test with:
//!     echo "hello" | nc -q1 localhost 9999
//!
//!     # Many concurrent clients:
//!     for i in $(seq 1 100); do echo "ping $i" | nc -q1 localhost 9999 & done

use corio::syscall::setsockopt;
use corio::{kdebug, kerror, kinfo, kwarn, spawn, Runtime, SchedulerConfig, TcpListener, TcpStream};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const BUF_SIZE: usize = 4096;

#[derive(Default)]
struct Stats {
    accepts: AtomicU64,
    closes: AtomicU64,
    bytes: AtomicU64,
    errors: AtomicU64,
}

impl Stats {
    fn print(&self) {
        kinfo!(
            "accepts={} closes={} bytes={} errors={}",
            self.accepts.load(Ordering::Relaxed),
            self.closes.load(Ordering::Relaxed),
            self.bytes.load(Ordering::Relaxed),
            self.errors.load(Ordering::Relaxed),
        );
    }
}

/// Drop idle clients after `ms` without data
fn set_recv_timeout(stream: &TcpStream, ms: u64) {
    let tv = libc::timeval {
        tv_sec: (ms / 1000) as libc::time_t,
        tv_usec: ((ms % 1000) * 1000) as libc::suseconds_t,
    };
    let ret = unsafe {
        setsockopt(
            stream.fd(),
            libc::SOL_SOCKET,
            libc::SO_RCVTIMEO,
            &tv as *const libc::timeval as *const libc::c_void,
            std::mem::size_of::<libc::timeval>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        kwarn!("SO_RCVTIMEO on fd {} failed", stream.fd());
    }
}

fn handle(stream: TcpStream, peer: SocketAddrV4, stats: Arc<Stats>) {
    let mut buf = [0u8; BUF_SIZE];
    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                kdebug!("{}: read: {}", peer, e);
                stats.errors.fetch_add(1, Ordering::Relaxed);
                break;
            }
        };
        if let Err(e) = stream.write_all(&buf[..n]) {
            kdebug!("{}: write: {}", peer, e);
            stats.errors.fetch_add(1, Ordering::Relaxed);
            break;
        }
        stats.bytes.fetch_add(n as u64, Ordering::Relaxed);
    }
    let closes = stats.closes.fetch_add(1, Ordering::Relaxed) + 1;
    if closes % 1000 == 0 {
        stats.print();
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let port: u16 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(9999);
    let idle_ms: u64 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(30_000);

    eprintln!("=== corio Echo Server ===");
    eprintln!("  port:          {}", port);
    eprintln!("  idle timeout:  {} ms", idle_ms);

    let config = SchedulerConfig::from_env().name("echo");
    config.print();

    let runtime = match Runtime::new(config) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    let stats = Arc::new(Stats::default());
    let result = runtime.block_on(move || {
        // created on a worker so the listener is registered with the hook layer
        let listener = match TcpListener::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)) {
            Ok(l) => l,
            Err(e) => {
                kerror!("bind :{} failed: {}", port, e);
                return;
            }
        };
        kinfo!("listening on {:?}", listener.local_addr());

        loop {
            let (stream, peer) = match listener.accept() {
                Ok(conn) => conn,
                Err(e) => {
                    kerror!("accept: {}", e);
                    stats.errors.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };
            stats.accepts.fetch_add(1, Ordering::Relaxed);
            kdebug!("accepted {} (fd {})", peer, stream.fd());
            set_recv_timeout(&stream, idle_ms);

            let stats = stats.clone();
            if let Err(e) = spawn(move || handle(stream, peer, stats)) {
                kerror!("spawn: {}", e);
                break;
            }
        }
    });

    if let Err(e) = result {
        eprintln!("runtime error: {}", e);
        std::process::exit(1);
    }
}
