//! Edge-triggered epoll reactor
//!
//! The reactor is the scheduler `Driver` of an I/O-capable scheduler. Its
//! idle body blocks in `epoll_wait`, bounded by the next timer deadline,
//! and turns readiness and expired timers into scheduled tasks.
//!
//! A non-blocking self-pipe is registered under a reserved token; writing
//! one byte to it (a tickle) interrupts the wait.
//!
//! Interests are one-shot. Delivering an event removes it from the
//! descriptor's registration and re-arms epoll with whatever remains.

use super::fd_context::{EventCallback, FdContext};
use crate::config::SchedulerConfig;
use crate::fiber::Fiber;
use crate::scheduler::{Driver, Scheduler};
use crate::timer::{Timer, TimerManager};
use crate::tls;
use corio_core::error::{RuntimeError, RuntimeResult};
use corio_core::{kdebug, kerror, kfatal, ktrace, Event};
use nix::fcntl::OFlag;
use parking_lot::RwLock;
use std::any::Any;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

/// epoll user data of the tickle pipe
const TICKLE_TOKEN: u64 = u64::MAX;

const EPOLLIN: u32 = libc::EPOLLIN as u32;
const EPOLLOUT: u32 = libc::EPOLLOUT as u32;
const EPOLLET: u32 = libc::EPOLLET as u32;
const EPOLLERR: u32 = libc::EPOLLERR as u32;
const EPOLLHUP: u32 = libc::EPOLLHUP as u32;

#[inline]
fn epoll_bits(events: Event) -> u32 {
    let mut bits = 0;
    if events.contains(Event::READ) {
        bits |= EPOLLIN;
    }
    if events.contains(Event::WRITE) {
        bits |= EPOLLOUT;
    }
    bits
}

pub struct Reactor {
    epfd: OwnedFd,
    tickle_rx: OwnedFd,
    tickle_tx: OwnedFd,
    /// Indexed by fd; grows, never shrinks
    contexts: RwLock<Vec<Arc<FdContext>>>,
    /// Registered, not yet delivered interests
    pending: AtomicUsize,
    timers: TimerManager,
    scheduler: OnceLock<Weak<Scheduler>>,
    max_events: usize,
    max_wait_ms: u64,
}

impl Reactor {
    pub fn new(config: &SchedulerConfig) -> RuntimeResult<Arc<Reactor>> {
        let raw = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if raw < 0 {
            return Err(RuntimeError::last_os_error());
        }
        let epfd = unsafe { OwnedFd::from_raw_fd(raw) };

        let (tickle_rx, tickle_tx) =
            nix::unistd::pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).map_err(io::Error::from)?;

        let mut ev = libc::epoll_event {
            events: EPOLLIN | EPOLLET,
            u64: TICKLE_TOKEN,
        };
        let rc = unsafe {
            libc::epoll_ctl(epfd.as_raw_fd(), libc::EPOLL_CTL_ADD, tickle_rx.as_raw_fd(), &mut ev)
        };
        if rc < 0 {
            return Err(RuntimeError::last_os_error());
        }

        let contexts = (0..config.initial_fd_slots)
            .map(|fd| Arc::new(FdContext::new(fd as RawFd)))
            .collect();

        let reactor = Arc::new_cyclic(|weak: &Weak<Reactor>| {
            let timers = TimerManager::new();
            let weak = weak.clone();
            timers.set_front_hook(move || {
                if let Some(reactor) = weak.upgrade() {
                    reactor.wake();
                }
            });
            Reactor {
                epfd,
                tickle_rx,
                tickle_tx,
                contexts: RwLock::new(contexts),
                pending: AtomicUsize::new(0),
                timers,
                scheduler: OnceLock::new(),
                max_events: config.max_events,
                max_wait_ms: config.idle_wait_ms(),
            }
        });
        kdebug!("reactor created, epfd {}", reactor.epfd.as_raw_fd());
        Ok(reactor)
    }

    /// Bind to the scheduler this reactor drives; later calls are ignored
    pub fn attach(&self, sched: &Arc<Scheduler>) {
        let _ = self.scheduler.set(Arc::downgrade(sched));
    }

    /// Reactor driving the calling worker, if it belongs to an I/O scheduler
    pub fn current() -> Option<Arc<Reactor>> {
        Scheduler::current()?.driver().into_any().downcast::<Reactor>().ok()
    }

    pub fn scheduler(&self) -> Option<Arc<Scheduler>> {
        self.scheduler.get().and_then(Weak::upgrade)
    }

    #[inline]
    pub fn timers(&self) -> &TimerManager {
        &self.timers
    }

    pub fn add_timer<F>(&self, ms: u64, cb: F, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timers.add_timer(ms, cb, recurring)
    }

    pub fn add_condition_timer<F, T>(&self, ms: u64, cb: F, guard: Weak<T>, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
        T: ?Sized + Send + Sync + 'static,
    {
        self.timers.add_condition_timer(ms, cb, guard, recurring)
    }

    /// Interests registered and not yet delivered, across all descriptors
    pub fn pending_events(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Interests currently registered on `fd`
    pub fn registered_events(&self, fd: RawFd) -> Event {
        self.context(fd, false).map_or(Event::NONE, |ctx| ctx.events())
    }

    fn context(&self, fd: RawFd, create: bool) -> Option<Arc<FdContext>> {
        let idx = usize::try_from(fd).ok()?;
        {
            let table = self.contexts.read();
            if let Some(ctx) = table.get(idx) {
                return Some(ctx.clone());
            }
            if !create {
                return None;
            }
        }
        let mut table = self.contexts.write();
        if idx >= table.len() {
            let grow_to = (idx * 3 / 2).max(idx + 1);
            let start = table.len();
            table.extend((start..grow_to).map(|fd| Arc::new(FdContext::new(fd as RawFd))));
            ktrace!("fd table grown to {}", grow_to);
        }
        Some(table[idx].clone())
    }

    fn epoll_ctl(&self, op: libc::c_int, fd: RawFd, events: Event) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: EPOLLET | epoll_bits(events),
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut ev) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// Register a one-shot interest in `event` (READ or WRITE) on `fd`.
    ///
    /// With `cb` the callback is scheduled when the event fires; without,
    /// the calling fiber is, and it is expected to yield right after this
    /// returns. Registering an interest that is already registered is a
    /// fatal error.
    pub fn add_event(&self, fd: RawFd, event: Event, cb: Option<EventCallback>) -> RuntimeResult<()> {
        if event != Event::READ && event != Event::WRITE {
            kfatal!("add_event on fd {} with {:?}", fd, event);
        }
        let Some(ctx) = self.context(fd, true) else {
            return Err(io::Error::from_raw_os_error(libc::EBADF).into());
        };
        let Some(sched) = tls::scheduler_weak().or_else(|| self.scheduler.get().cloned()) else {
            return Err(RuntimeError::NoScheduler);
        };
        let fiber = match cb {
            Some(_) => None,
            None if Fiber::in_task_fiber() => Some(Fiber::current()),
            None => return Err(RuntimeError::NotInFiber),
        };

        let mut state = ctx.state.lock();
        if state.events.intersects(event) {
            kfatal!("fd {} already waits for {:?} (registered {:?})", fd, event, state.events);
        }
        let op = if state.events.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        if let Err(e) = self.epoll_ctl(op, fd, state.events | event) {
            kerror!("epoll_ctl({}, fd {}, {:?}) failed: {}", op, fd, state.events | event, e);
            return Err(e.into());
        }

        self.pending.fetch_add(1, Ordering::AcqRel);
        state.events |= event;
        let target = state.context_mut(event);
        target.scheduler = Some(sched);
        target.fiber = fiber;
        target.callback = cb;
        Ok(())
    }

    /// Drop a registration without running it.
    ///
    /// A fiber stored as the target is released; if that was its last
    /// handle it must not be a suspended fiber.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(ctx) = self.context(fd, false) else {
            return false;
        };
        let mut state = ctx.state.lock();
        if !state.events.intersects(event) {
            return false;
        }
        let left = state.events - event;
        if !self.rearm(fd, left) {
            return false;
        }
        self.pending.fetch_sub(1, Ordering::AcqRel);
        drop(state.clear(event));
        true
    }

    /// Remove a registration and schedule its target as if the event fired
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        self.cancel_event_with(fd, event, || {})
    }

    /// `cancel_event`, running `before` under the descriptor lock first.
    ///
    /// `before` only runs when the interest is still registered, so a
    /// timeout marker set there cannot race a real readiness delivery.
    pub fn cancel_event_with<F>(&self, fd: RawFd, event: Event, before: F) -> bool
    where
        F: FnOnce(),
    {
        let Some(ctx) = self.context(fd, false) else {
            return false;
        };
        let mut state = ctx.state.lock();
        if !state.events.intersects(event) {
            return false;
        }
        before();
        let left = state.events - event;
        if !self.rearm(fd, left) {
            return false;
        }
        state.trigger(fd, event);
        self.pending.fetch_sub(1, Ordering::AcqRel);
        true
    }

    /// Trigger and remove every interest on `fd`
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(ctx) = self.context(fd, false) else {
            return false;
        };
        let mut state = ctx.state.lock();
        if state.events.is_empty() {
            return false;
        }
        if !self.rearm(fd, Event::NONE) {
            return false;
        }
        for event in [Event::READ, Event::WRITE] {
            if state.events.contains(event) {
                state.trigger(fd, event);
                self.pending.fetch_sub(1, Ordering::AcqRel);
            }
        }
        true
    }

    /// Point epoll at the interests that remain (deregister when none)
    fn rearm(&self, fd: RawFd, left: Event) -> bool {
        let op = if left.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        match self.epoll_ctl(op, fd, left) {
            Ok(()) => true,
            Err(e) => {
                kerror!("epoll_ctl({}, fd {}, {:?}) failed: {}", op, fd, left, e);
                false
            }
        }
    }

    /// Interrupt a blocked `epoll_wait`
    pub fn wake(&self) {
        let byte = [1u8];
        // a full pipe already guarantees a wake-up
        let _ = unsafe {
            libc::write(self.tickle_tx.as_raw_fd(), byte.as_ptr() as *const libc::c_void, 1)
        };
    }

    fn drain_tickle(&self) {
        let mut buf = [0u8; 256];
        loop {
            let n = unsafe {
                libc::read(self.tickle_rx.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n <= 0 {
                break;
            }
        }
    }

    /// Deliver one readiness report for a registered descriptor
    fn deliver(&self, fd: RawFd, mut bits: u32) {
        let Some(ctx) = self.context(fd, false) else {
            return;
        };
        let mut state = ctx.state.lock();
        if bits & (EPOLLERR | EPOLLHUP) != 0 {
            bits |= (EPOLLIN | EPOLLOUT) & epoll_bits(state.events);
        }
        let mut ready = Event::NONE;
        if bits & EPOLLIN != 0 {
            ready |= Event::READ;
        }
        if bits & EPOLLOUT != 0 {
            ready |= Event::WRITE;
        }
        let ready = ready & state.events;
        if ready.is_empty() {
            return;
        }

        if !self.rearm(fd, state.events - ready) {
            return;
        }
        for event in [Event::READ, Event::WRITE] {
            if ready.contains(event) {
                state.trigger(fd, event);
                self.pending.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    fn wait(&self, events: &mut [libc::epoll_event], timeout_ms: u64) -> usize {
        let timeout = timeout_ms.min(i32::MAX as u64) as i32;
        loop {
            let n = unsafe {
                libc::epoll_wait(self.epfd.as_raw_fd(), events.as_mut_ptr(), events.len() as i32, timeout)
            };
            if n >= 0 {
                return n as usize;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                kerror!("epoll_wait failed: {}", err);
                return 0;
            }
        }
    }
}

impl Driver for Reactor {
    fn tickle(&self, _sched: &Scheduler) {
        self.wake();
    }

    fn idle(&self, sched: &Scheduler) {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; self.max_events];
        loop {
            if self.stopping(sched) {
                // other workers may still be blocked in epoll_wait
                self.wake();
                kdebug!("{} reactor idle exits", sched.name());
                break;
            }

            let budget = self
                .timers
                .next_timer()
                .map_or(self.max_wait_ms, |ms| ms.min(self.max_wait_ms));
            let n = self.wait(&mut events, budget);

            let expired = self.timers.list_expired();
            if !expired.is_empty() {
                ktrace!("{} timers expired", expired.len());
                sched.schedule_batch(expired.into_iter().map(|cb| move || cb()));
            }

            for ev in &events[..n] {
                // epoll_event is packed: copy the fields out
                let (bits, token) = (ev.events, ev.u64);
                if token == TICKLE_TOKEN {
                    self.drain_tickle();
                    continue;
                }
                self.deliver(token as RawFd, bits);
            }

            Fiber::yield_now();
        }
    }

    fn stopping(&self, sched: &Scheduler) -> bool {
        !self.timers.has_timer() && self.pending_events() == 0 && sched.base_stopping()
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("epfd", &self.epfd.as_raw_fd())
            .field("pending", &self.pending_events())
            .field("timers", &self.timers.len())
            .finish()
    }
}
