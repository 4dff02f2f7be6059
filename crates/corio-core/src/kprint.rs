//! Kernel-style print macros for corio
//!
//! Leveled, line-atomic output on stderr. Every leveled line carries the
//! OS thread name and the id of the fiber running on it, so interleaved
//! output from many workers stays readable.
//!
//! # Environment Variables
//!
//! - `CORIO_FLUSH_EPRINT=1` - Flush stderr after each print (useful for debugging crashes)
//! - `CORIO_LOG_LEVEL=<level>` - off, fatal, error, warn, info, debug, trace (or 0..6)
//!
//! # Usage
//!
//! ```ignore
//! use corio_core::{kinfo, kdebug, kfatal};
//!
//! kinfo!("worker {} started", id);
//! kdebug!("fd={} events={:?}", fd, events);
//! kfatal!("fiber {} destroyed while running", id); // logs, then aborts
//! ```

use std::cell::Cell;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Log levels, most severe first
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Fatal = 1,
    Error = 2,
    Warn = 3,
    Info = 4,
    Debug = 5,
    Trace = 6,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Fatal,
            2 => LogLevel::Error,
            3 => LogLevel::Warn,
            4 => LogLevel::Info,
            5 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    /// Parse a level name or number; unknown input yields `None`
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "off" | "0" => Some(LogLevel::Off),
            "fatal" | "1" => Some(LogLevel::Fatal),
            "error" | "2" => Some(LogLevel::Error),
            "warn" | "3" => Some(LogLevel::Warn),
            "info" | "4" => Some(LogLevel::Info),
            "debug" | "5" => Some(LogLevel::Debug),
            "trace" | "6" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Fatal => "[FATAL]",
            LogLevel::Error => "[ERROR]",
            LogLevel::Warn => "[WARN] ",
            LogLevel::Info => "[INFO] ",
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Trace => "[TRACE]",
        }
    }
}

static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

thread_local! {
    /// Fiber currently running on this thread, as last reported by the runtime
    static CONTEXT_FIBER: Cell<u64> = const { Cell::new(0) };
}

/// Initialize logging from environment variables
///
/// Called automatically on first log, but can be called explicitly for
/// deterministic initialization.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    FLUSH_ENABLED.store(
        crate::env::env_get_bool("CORIO_FLUSH_EPRINT", false),
        Ordering::Relaxed,
    );

    if let Some(level) = std::env::var("CORIO_LOG_LEVEL")
        .ok()
        .and_then(|v| LogLevel::parse(&v))
    {
        LOG_LEVEL.store(level as u8, Ordering::Relaxed);
    }
}

#[inline]
pub fn flush_enabled() -> bool {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    FLUSH_ENABLED.load(Ordering::Relaxed)
}

#[inline]
pub fn log_level() -> LogLevel {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Set log level programmatically (overrides the environment)
pub fn set_log_level(level: LogLevel) {
    INITIALIZED.store(true, Ordering::SeqCst);
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn set_flush_enabled(enabled: bool) {
    FLUSH_ENABLED.store(enabled, Ordering::Relaxed);
}

#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level != LogLevel::Off && level <= log_level()
}

/// Record which fiber is running on the calling thread.
///
/// The runtime calls this on every switch.
#[inline]
pub fn set_context_fiber(id: u64) {
    let _ = CONTEXT_FIBER.try_with(|c| c.set(id));
}

#[inline]
pub fn context_fiber() -> u64 {
    CONTEXT_FIBER.try_with(|c| c.get()).unwrap_or(0)
}

fn write_context(out: &mut impl Write) {
    let thread = std::thread::current();
    let _ = write!(
        out,
        "[{} fiber={}] ",
        thread.name().unwrap_or("-"),
        context_fiber()
    );
}

#[doc(hidden)]
pub fn _kprint_impl(args: std::fmt::Arguments<'_>) {
    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let _ = handle.write_fmt(args);
    if flush_enabled() {
        let _ = handle.flush();
    }
}

#[doc(hidden)]
pub fn _kprintln_impl(args: std::fmt::Arguments<'_>) {
    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let _ = handle.write_fmt(args);
    let _ = handle.write_all(b"\n");
    if flush_enabled() {
        let _ = handle.flush();
    }
}

#[doc(hidden)]
pub fn _klog_impl(level: LogLevel, args: std::fmt::Arguments<'_>) {
    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let _ = write!(handle, "{} ", level.prefix());
    write_context(&mut handle);
    let _ = handle.write_fmt(args);
    let _ = handle.write_all(b"\n");
    if flush_enabled() {
        let _ = handle.flush();
    }
}

/// Log at fatal level (even when logging is off) and abort the process.
#[doc(hidden)]
#[cold]
pub fn _kfatal_impl(args: std::fmt::Arguments<'_>) -> ! {
    {
        let stderr = std::io::stderr();
        let mut handle = stderr.lock();
        let _ = write!(handle, "{} ", LogLevel::Fatal.prefix());
        write_context(&mut handle);
        let _ = handle.write_fmt(args);
        let _ = handle.write_all(b"\n");
        let _ = handle.flush();
    }
    std::process::abort()
}

// ── macros ──

/// Print to stderr (no newline)
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => {
        $crate::kprint::_kprint_impl(format_args!($($arg)*))
    };
}

/// Print to stderr with newline
#[macro_export]
macro_rules! kprintln {
    () => {
        $crate::kprint::_kprintln_impl(format_args!(""))
    };
    ($($arg:tt)*) => {
        $crate::kprint::_kprintln_impl(format_args!($($arg)*))
    };
}

/// Leveled line; arguments are not evaluated when the level is filtered out
#[macro_export]
macro_rules! klog {
    ($level:expr, $($arg:tt)*) => {{
        let level = $level;
        if $crate::kprint::level_enabled(level) {
            $crate::kprint::_klog_impl(level, format_args!($($arg)*));
        }
    }};
}

/// Unrecoverable invariant violation: log and abort. Never returns.
#[macro_export]
macro_rules! kfatal {
    ($($arg:tt)*) => {
        $crate::kprint::_kfatal_impl(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => { $crate::klog!($crate::kprint::LogLevel::Error, $($arg)*) };
}

#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => { $crate::klog!($crate::kprint::LogLevel::Warn, $($arg)*) };
}

#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => { $crate::klog!($crate::kprint::LogLevel::Info, $($arg)*) };
}

#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => { $crate::klog!($crate::kprint::LogLevel::Debug, $($arg)*) };
}

/// Most verbose
#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => { $crate::klog!($crate::kprint::LogLevel::Trace, $($arg)*) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_levels() {
        assert!(LogLevel::Fatal < LogLevel::Error);
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Info < LogLevel::Debug);
        assert!(LogLevel::Debug < LogLevel::Trace);
    }

    #[test]
    fn test_level_parse() {
        assert_eq!(LogLevel::parse("DEBUG"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("1"), Some(LogLevel::Fatal));
        assert_eq!(LogLevel::parse("loud"), None);
        assert_eq!(LogLevel::from_u8(99), LogLevel::Trace);
    }

    #[test]
    fn test_context_fiber_is_per_thread() {
        set_context_fiber(42);
        assert_eq!(context_fiber(), 42);
        let other = std::thread::spawn(context_fiber).join().unwrap();
        assert_eq!(other, 0);
        set_context_fiber(0);
    }

    #[test]
    fn test_filtered_arguments_are_not_evaluated() {
        fn boom() -> &'static str {
            panic!("evaluated");
        }
        set_log_level(LogLevel::Info);
        ktrace!("{}", boom());
        assert!(!level_enabled(LogLevel::Debug));
        assert!(level_enabled(LogLevel::Warn));
    }

    #[test]
    fn test_macros_compile() {
        kprint!("");
        kerror!("error {}", "msg");
        kwarn!("warn");
        kinfo!("info");
        kdebug!("debug");
        ktrace!("trace");
    }
}
