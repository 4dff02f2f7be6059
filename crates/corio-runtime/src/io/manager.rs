//! IoManager: a scheduler driven by the epoll reactor

use super::fd_context::EventCallback;
use super::reactor::Reactor;
use crate::config::SchedulerConfig;
use crate::fiber::Fiber;
use crate::scheduler::{Scheduler, Task};
use crate::timer::Timer;
use corio_core::error::RuntimeResult;
use corio_core::{kdebug, Event};
use std::os::fd::RawFd;
use std::sync::{Arc, Weak};

/// Scheduler + reactor pair
///
/// Started on construction and stopped on drop. With `use_caller` both
/// must happen on the same thread, since `stop()` runs the caller's share
/// of the work.
pub struct IoManager {
    scheduler: Arc<Scheduler>,
    reactor: Arc<Reactor>,
}

impl IoManager {
    pub fn new(config: SchedulerConfig) -> RuntimeResult<IoManager> {
        let reactor = Reactor::new(&config)?;
        let scheduler = Scheduler::with_driver(config, reactor.clone())?;
        reactor.attach(&scheduler);
        scheduler.start()?;
        kdebug!("io manager {} running", scheduler.name());
        Ok(IoManager { scheduler, reactor })
    }

    /// `threads` workers named `name_<i>`, optionally including the caller
    pub fn with_threads(threads: usize, use_caller: bool, name: &str) -> RuntimeResult<IoManager> {
        Self::new(
            SchedulerConfig::from_env()
                .threads(threads)
                .use_caller(use_caller)
                .name(name),
        )
    }

    /// Reactor of the I/O scheduler the calling worker belongs to
    pub fn current() -> Option<Arc<Reactor>> {
        Reactor::current()
    }

    #[inline]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    #[inline]
    pub fn reactor(&self) -> &Arc<Reactor> {
        &self.reactor
    }

    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.scheduler.schedule(f);
    }

    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.scheduler.schedule_fiber(fiber);
    }

    pub fn schedule_on(&self, task: Task, worker: Option<usize>) {
        self.scheduler.schedule_on(task, worker);
    }

    pub fn add_event(&self, fd: RawFd, event: Event, cb: Option<EventCallback>) -> RuntimeResult<()> {
        self.reactor.add_event(fd, event, cb)
    }

    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        self.reactor.del_event(fd, event)
    }

    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        self.reactor.cancel_event(fd, event)
    }

    pub fn cancel_all(&self, fd: RawFd) -> bool {
        self.reactor.cancel_all(fd)
    }

    pub fn add_timer<F>(&self, ms: u64, cb: F, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.reactor.add_timer(ms, cb, recurring)
    }

    pub fn add_condition_timer<F, T>(&self, ms: u64, cb: F, guard: Weak<T>, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
        T: ?Sized + Send + Sync + 'static,
    {
        self.reactor.add_condition_timer(ms, cb, guard, recurring)
    }

    /// Milliseconds until the earliest timer, `None` if there is none
    pub fn next_timer(&self) -> Option<u64> {
        self.reactor.timers().next_timer()
    }

    pub fn pending_events(&self) -> usize {
        self.reactor.pending_events()
    }

    /// Wait until no task, timer or registered event is left, then join the workers
    pub fn stop(&self) {
        self.scheduler.stop();
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        self.scheduler.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corio_core::error::RuntimeError;
    use nix::fcntl::OFlag;
    use parking_lot::Mutex;
    use std::os::fd::{AsRawFd, OwnedFd};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    fn config(threads: usize, use_caller: bool) -> SchedulerConfig {
        SchedulerConfig::new()
            .threads(threads)
            .use_caller(use_caller)
            .name("iom")
            .max_idle_wait(Duration::from_millis(50))
    }

    fn pipe() -> (OwnedFd, OwnedFd) {
        nix::unistd::pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).unwrap()
    }

    fn write_all(fd: &OwnedFd, data: &[u8]) {
        let n = unsafe { libc::write(fd.as_raw_fd(), data.as_ptr().cast(), data.len()) };
        assert_eq!(n, data.len() as isize);
    }

    fn wait_until(limit: Duration, cond: impl Fn() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < limit {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> EventCallback) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let make = move || -> EventCallback {
            let h = h.clone();
            Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            })
        };
        (hits, make)
    }

    #[test]
    fn test_read_event_fires_once() {
        let iom = IoManager::new(config(1, false)).unwrap();
        let (rx, tx) = pipe();
        let fd = rx.as_raw_fd();
        let (hits, cb) = counter();

        iom.add_event(fd, Event::READ, Some(cb())).unwrap();
        assert_eq!(iom.reactor().registered_events(fd), Event::READ);
        assert_eq!(iom.pending_events(), 1);

        write_all(&tx, b"x");
        assert!(wait_until(Duration::from_secs(2), || hits.load(Ordering::SeqCst) == 1));
        assert_eq!(iom.reactor().registered_events(fd), Event::NONE);
        assert_eq!(iom.pending_events(), 0);

        // no interest left: more data wakes nobody
        write_all(&tx, b"y");
        thread::sleep(Duration::from_millis(50));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        iom.stop();
    }

    #[test]
    fn test_fiber_waits_for_readiness() {
        let iom = IoManager::new(config(2, false)).unwrap();
        let (rx, tx) = pipe();
        let fd = rx.as_raw_fd();
        let got = Arc::new(Mutex::new(Vec::new()));

        let g = got.clone();
        iom.schedule(move || {
            let reactor = IoManager::current().unwrap();
            reactor.add_event(fd, Event::READ, None).unwrap();
            Fiber::yield_now();
            let mut buf = [0u8; 16];
            let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
            assert!(n > 0);
            g.lock().extend_from_slice(&buf[..n as usize]);
        });

        assert!(wait_until(Duration::from_secs(2), || iom.pending_events() == 1));
        write_all(&tx, b"hello");
        iom.stop();
        assert_eq!(got.lock().as_slice(), b"hello");
    }

    #[test]
    fn test_cancel_fires_and_del_does_not() {
        let iom = IoManager::new(config(1, false)).unwrap();
        let (rx, _tx) = pipe();
        let fd = rx.as_raw_fd();
        let (hits, cb) = counter();

        iom.add_event(fd, Event::READ, Some(cb())).unwrap();
        iom.add_event(fd, Event::WRITE, Some(cb())).unwrap();
        assert_eq!(iom.reactor().registered_events(fd), Event::READ | Event::WRITE);

        assert!(iom.del_event(fd, Event::WRITE));
        assert!(!iom.del_event(fd, Event::WRITE));
        assert_eq!(iom.reactor().registered_events(fd), Event::READ);

        assert!(iom.cancel_event(fd, Event::READ));
        assert!(!iom.cancel_event(fd, Event::READ));
        assert!(wait_until(Duration::from_secs(2), || hits.load(Ordering::SeqCst) == 1));
        assert_eq!(iom.pending_events(), 0);
        iom.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_all_wakes_every_interest() {
        let iom = IoManager::new(config(1, false)).unwrap();
        let (rx, _tx) = pipe();
        let fd = rx.as_raw_fd();
        let (hits, cb) = counter();

        assert!(!iom.cancel_all(fd));
        iom.add_event(fd, Event::READ, Some(cb())).unwrap();
        iom.add_event(fd, Event::WRITE, Some(cb())).unwrap();
        assert!(iom.cancel_all(fd));
        assert!(!iom.cancel_all(fd));
        iom.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(iom.reactor().registered_events(fd), Event::NONE);
    }

    #[test]
    fn test_read_waiter_wakes_on_hangup() {
        let iom = IoManager::new(config(1, false)).unwrap();
        let (rx, tx) = pipe();
        let fd = rx.as_raw_fd();
        let (hits, cb) = counter();

        iom.add_event(fd, Event::READ, Some(cb())).unwrap();
        // empty pipe, writer gone: epoll reports HUP without IN
        drop(tx);
        assert!(wait_until(Duration::from_secs(2), || hits.load(Ordering::SeqCst) == 1));
        assert_eq!(iom.reactor().registered_events(fd), Event::NONE);
        assert_eq!(iom.pending_events(), 0);
        iom.stop();
    }

    #[test]
    fn test_write_waiter_wakes_on_error() {
        let iom = IoManager::new(config(1, false)).unwrap();
        let (rx, tx) = pipe();
        let fd = tx.as_raw_fd();
        // fill the pipe so the writer is not ready on its own
        let chunk = [0u8; 4096];
        while unsafe { libc::write(fd, chunk.as_ptr().cast(), chunk.len()) } > 0 {}
        let (hits, cb) = counter();

        iom.add_event(fd, Event::WRITE, Some(cb())).unwrap();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        // full pipe, reader gone: epoll reports ERR without OUT
        drop(rx);
        assert!(wait_until(Duration::from_secs(2), || hits.load(Ordering::SeqCst) == 1));
        assert_eq!(iom.reactor().registered_events(fd), Event::NONE);
        assert_eq!(iom.pending_events(), 0);
        iom.stop();
    }

    #[test]
    fn test_event_needs_fiber_or_callback() {
        let iom = IoManager::new(config(1, false)).unwrap();
        let (rx, _tx) = pipe();
        let err = iom.add_event(rx.as_raw_fd(), Event::READ, None).unwrap_err();
        assert!(matches!(err, RuntimeError::NotInFiber));
        assert_eq!(iom.pending_events(), 0);
    }

    #[test]
    fn test_early_timer_interrupts_long_wait() {
        // idle wait ceiling far above the timer delay
        let iom = IoManager::new(config(1, false).max_idle_wait(Duration::from_secs(5))).unwrap();
        thread::sleep(Duration::from_millis(20));

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let start = Instant::now();
        iom.add_timer(
            30,
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );
        assert!(wait_until(Duration::from_secs(3), || hits.load(Ordering::SeqCst) == 1));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(25), "fired early: {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(1), "fired late: {:?}", elapsed);
        iom.stop();
    }

    #[test]
    fn test_stop_waits_for_timers() {
        let iom = IoManager::new(config(2, false)).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        iom.add_timer(
            40,
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );
        assert!(iom.next_timer().is_some());
        iom.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(iom.next_timer(), None);
    }

    #[test]
    fn test_recurring_timer_until_cancelled() {
        let iom = IoManager::new(config(1, false)).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let timer = iom.add_timer(
            10,
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            true,
        );
        assert!(wait_until(Duration::from_secs(2), || hits.load(Ordering::SeqCst) >= 3));
        assert!(timer.cancel());
        iom.stop();
    }

    #[test]
    fn test_use_caller_runs_on_drop() {
        thread::spawn(|| {
            let hits = Arc::new(AtomicUsize::new(0));
            {
                let iom = IoManager::new(config(2, true)).unwrap();
                for _ in 0..20 {
                    let h = hits.clone();
                    iom.schedule(move || {
                        assert!(IoManager::current().is_some());
                        h.fetch_add(1, Ordering::SeqCst);
                    });
                }
            }
            assert_eq!(hits.load(Ordering::SeqCst), 20);
            assert!(Scheduler::current().is_none());
        })
        .join()
        .unwrap();
    }
}
