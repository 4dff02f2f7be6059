//! M:N task scheduler
//!
//! A `Scheduler` owns a FIFO queue of tasks (fibers or plain callbacks)
//! and a pool of worker threads. Every worker runs the same dispatch loop:
//!
//! ```text
//!   loop {
//!       pick first task that is not pinned elsewhere and not Running
//!       ├── fiber    ─► resume it
//!       ├── callback ─► run it on a scratch fiber (reused once it terminates)
//!       └── nothing  ─► resume the idle fiber (Driver::idle)
//!   }   until the idle fiber terminates, which requires stopping()
//! ```
//!
//! What "idle" means is pluggable through the [`Driver`] trait: the base
//! driver parks on a condvar, the I/O reactor blocks in epoll.
//!
//! With `use_caller` the constructing thread is worker 0. Its dispatch
//! loop runs inside a root fiber that `stop()` resumes, so the caller
//! drains the queue before the scheduler shuts down.

use crate::config::SchedulerConfig;
use crate::fiber::Fiber;
use crate::tls;
use crate::worker::WorkerPool;
use corio_core::error::{RuntimeError, RuntimeResult};
use corio_core::{kdebug, kfatal, kwarn, FiberState};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

/// Unit of work in the queue
pub enum Task {
    /// Resume this fiber (must have been created with `run_in_scheduler`)
    Fiber(Arc<Fiber>),
    /// Run this callback on a scheduler-owned fiber
    Call(Box<dyn FnOnce() + Send + 'static>),
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Fiber(fiber) => write!(f, "Task::Fiber({})", fiber.id()),
            Task::Call(_) => f.write_str("Task::Call"),
        }
    }
}

struct ScheduleTask {
    task: Task,
    /// Worker index this task is pinned to
    worker: Option<usize>,
}

/// Behaviour a scheduler delegates to its environment
pub trait Driver: Send + Sync + 'static {
    /// Wake (at least) one idle worker
    fn tickle(&self, sched: &Scheduler);

    /// Body of every worker's idle fiber.
    ///
    /// Must yield back to the dispatch loop whenever work may have
    /// arrived, and return once `sched.stopping()` holds.
    fn idle(&self, sched: &Scheduler);

    /// Whether the scheduler may shut down. Implementations narrow
    /// `sched.base_stopping()` with their own conditions.
    fn stopping(&self, sched: &Scheduler) -> bool {
        sched.base_stopping()
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Default driver: idle workers park on a condvar
pub struct BaseDriver {
    permits: Mutex<usize>,
    cond: Condvar,
    max_wait: Duration,
}

impl BaseDriver {
    pub fn new(max_wait: Duration) -> Self {
        Self {
            permits: Mutex::new(0),
            cond: Condvar::new(),
            max_wait,
        }
    }
}

impl Driver for BaseDriver {
    fn tickle(&self, _sched: &Scheduler) {
        let mut permits = self.permits.lock();
        *permits = permits.saturating_add(1);
        self.cond.notify_one();
    }

    fn idle(&self, sched: &Scheduler) {
        loop {
            if sched.stopping() {
                // pass the wake on to the next parked worker
                self.tickle(sched);
                break;
            }
            {
                let mut permits = self.permits.lock();
                if *permits == 0 {
                    let _ = self.cond.wait_for(&mut permits, self.max_wait);
                }
                *permits = permits.saturating_sub(1);
            }
            Fiber::yield_now();
        }
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Fiber scheduler over a pool of worker threads
pub struct Scheduler {
    config: SchedulerConfig,
    queue: Mutex<VecDeque<ScheduleTask>>,
    driver: Arc<dyn Driver>,
    workers: Mutex<WorkerPool>,
    active: AtomicUsize,
    idle: AtomicUsize,
    stopping: AtomicBool,
    started: AtomicBool,
    /// Workers joined; nothing will dequeue again
    stopped: AtomicBool,
    /// Runs worker 0's dispatch loop on the caller thread (`use_caller` only)
    root_fiber: Option<Arc<Fiber>>,
    caller: ThreadId,
    weak_self: Weak<Scheduler>,
}

impl Scheduler {
    /// Scheduler with the condvar-parking driver
    pub fn new(config: SchedulerConfig) -> RuntimeResult<Arc<Scheduler>> {
        let driver = Arc::new(BaseDriver::new(config.max_idle_wait));
        Self::with_driver(config, driver)
    }

    /// Scheduler with a custom driver.
    ///
    /// With `use_caller` this binds the calling thread to the new
    /// scheduler; that thread must not already belong to one.
    pub fn with_driver(config: SchedulerConfig, driver: Arc<dyn Driver>) -> RuntimeResult<Arc<Scheduler>> {
        config.validate()?;

        if config.use_caller {
            if tls::scheduler().is_some() {
                kfatal!("thread already belongs to a scheduler");
            }
            // the root fiber yields back to the caller's thread fiber
            let _ = Fiber::current();
        }

        let sched = Arc::new_cyclic(|weak: &Weak<Scheduler>| {
            let root_fiber = config.use_caller.then(|| {
                let weak = weak.clone();
                Fiber::new(
                    move || {
                        if let Some(sched) = weak.upgrade() {
                            sched.run(0);
                        }
                    },
                    config.stack_size,
                    false,
                )
            });
            Scheduler {
                queue: Mutex::new(VecDeque::new()),
                driver,
                workers: Mutex::new(WorkerPool::new(&config.name)),
                active: AtomicUsize::new(0),
                idle: AtomicUsize::new(0),
                stopping: AtomicBool::new(false),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                root_fiber,
                caller: thread::current().id(),
                weak_self: weak.clone(),
                config,
            }
        });

        if let Some(root) = &sched.root_fiber {
            tls::set_scheduler(Some(Arc::downgrade(&sched)));
            tls::set_scheduler_fiber(Arc::as_ptr(root));
            tls::set_worker_id(0);
        }
        kdebug!("scheduler {} created", sched.config.name);
        Ok(sched)
    }

    /// Scheduler the calling thread belongs to
    pub fn current() -> Option<Arc<Scheduler>> {
        tls::scheduler()
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    #[inline]
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    #[inline]
    pub fn driver(&self) -> Arc<dyn Driver> {
        self.driver.clone()
    }

    /// Spawn the worker threads
    pub fn start(&self) -> RuntimeResult<()> {
        if self.stopping.load(Ordering::Acquire) {
            return Err(RuntimeError::Stopping);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(RuntimeError::AlreadyStarted);
        }
        let first = usize::from(self.config.use_caller);
        let mut workers = self.workers.lock();
        for index in first..self.config.threads {
            let Some(sched) = self.weak_self.upgrade() else {
                return Err(RuntimeError::NoScheduler);
            };
            workers.spawn(index, move || sched.run(index))?;
        }
        kdebug!("scheduler {} started, {} spawned workers", self.name(), workers.len());
        Ok(())
    }

    /// Queue a callback on any worker
    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_on(Task::Call(Box::new(f)), None);
    }

    /// Queue a fiber on any worker
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.schedule_on(Task::Fiber(fiber), None);
    }

    /// Queue a task, optionally pinned to one worker.
    ///
    /// Pinning to a worker index this scheduler does not have is fatal.
    /// Work arriving after `stop()` has joined the workers is dropped with
    /// a warning.
    pub fn schedule_on(&self, task: Task, worker: Option<usize>) {
        match self.try_schedule_on(task, worker) {
            Ok(()) => {}
            Err(RuntimeError::Stopping) => {
                kwarn!("scheduler {} already stopped, task dropped", self.name());
            }
            Err(e) => kfatal!("scheduler {}: {}", self.name(), e),
        }
    }

    /// `schedule_on` that reports instead of aborting or dropping
    pub fn try_schedule_on(&self, task: Task, worker: Option<usize>) -> RuntimeResult<()> {
        if let Some(index) = worker {
            if index >= self.config.threads {
                return Err(RuntimeError::InvalidWorker {
                    worker: index,
                    threads: self.config.threads,
                });
            }
        }
        let was_empty = {
            let mut queue = self.queue.lock();
            // checked under the lock: stop() sets it while holding the queue
            if self.stopped.load(Ordering::Acquire) {
                return Err(RuntimeError::Stopping);
            }
            let was_empty = queue.is_empty();
            queue.push_back(ScheduleTask { task, worker });
            was_empty
        };
        if was_empty {
            self.tickle();
        }
        Ok(())
    }

    /// Queue several callbacks under one lock acquisition
    pub fn schedule_batch<I, F>(&self, tasks: I)
    where
        I: IntoIterator<Item = F>,
        F: FnOnce() + Send + 'static,
    {
        let need_tickle = {
            let mut queue = self.queue.lock();
            let was_empty = queue.is_empty();
            queue.extend(tasks.into_iter().map(|f| ScheduleTask {
                task: Task::Call(Box::new(f)),
                worker: None,
            }));
            was_empty && !queue.is_empty()
        };
        if need_tickle {
            self.tickle();
        }
    }

    #[inline]
    pub fn tickle(&self) {
        self.driver.tickle(self);
    }

    /// Stop requested, queue drained and no worker busy
    pub fn base_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
            && self.active.load(Ordering::Acquire) == 0
            && self.queue.lock().is_empty()
    }

    /// Whether the dispatch loops may exit (driver-refined)
    pub fn stopping(&self) -> bool {
        self.driver.stopping(self)
    }

    #[inline]
    pub fn is_stop_requested(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub fn has_idle_threads(&self) -> bool {
        self.idle.load(Ordering::Acquire) > 0
    }

    #[inline]
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    #[inline]
    pub fn idle_count(&self) -> usize {
        self.idle.load(Ordering::Acquire)
    }

    /// Tasks waiting in the queue
    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    /// Request shutdown and wait for every worker.
    ///
    /// With `use_caller` this must be called from the constructing thread
    /// (outside any task fiber) and runs the caller's share of the work
    /// before returning. Otherwise it must not be called from one of this
    /// scheduler's own workers. Calling it again is a no-op.
    pub fn stop(&self) {
        if self.config.use_caller {
            if thread::current().id() != self.caller {
                kfatal!("scheduler {} stopped from a thread other than its caller", self.name());
            }
        } else if Self::current().is_some_and(|cur| std::ptr::eq(Arc::as_ptr(&cur), self)) {
            kfatal!("scheduler {} stopped from its own worker", self.name());
        }

        self.stopping.store(true, Ordering::Release);
        for _ in 0..self.config.threads {
            self.tickle();
        }
        if let Some(root) = &self.root_fiber {
            self.tickle();
            if root.state() == FiberState::Ready && !self.stopping() {
                root.resume();
            }
        }

        let mut workers = self.workers.lock();
        workers.join();
        drop(workers);
        {
            let queue = self.queue.lock();
            self.stopped.store(true, Ordering::Release);
            if !queue.is_empty() {
                kwarn!("scheduler {} stopped with {} queued tasks", self.name(), queue.len());
            }
        }

        if self.root_fiber.is_some() {
            self.release_caller();
        }
        kdebug!("scheduler {} stopped", self.name());
    }

    /// Detach the caller thread's runtime context
    fn release_caller(&self) {
        if thread::current().id() != self.caller {
            return;
        }
        let ours = tls::scheduler_weak().is_some_and(|w| std::ptr::eq(w.as_ptr(), self));
        if ours {
            tls::set_scheduler(None);
            tls::set_scheduler_fiber(std::ptr::null());
            tls::set_worker_id(usize::MAX);
        }
    }

    /// Dispatch loop for worker `worker`
    fn run(self: &Arc<Self>, worker: usize) {
        kdebug!("{} worker {} running", self.name(), worker);
        tls::set_hook_enabled(true);
        tls::set_worker_id(worker);
        tls::set_scheduler(Some(self.weak_self.clone()));

        let on_root = self
            .root_fiber
            .as_ref()
            .is_some_and(|root| std::ptr::eq(tls::current_fiber_ptr(), Arc::as_ptr(root)));
        if !on_root {
            let main = Fiber::current();
            tls::set_scheduler_fiber(Arc::as_ptr(&main));
        }

        let idle_fiber = {
            let driver = self.driver.clone();
            let sched = self.clone();
            Fiber::new(move || driver.idle(&sched), self.config.stack_size, true)
        };
        let mut scratch: Option<Arc<Fiber>> = None;

        loop {
            let mut tickle_me = false;
            let mut busy_skipped = false;
            let picked = {
                let mut queue = self.queue.lock();
                let mut picked = None;
                let mut i = 0;
                while i < queue.len() {
                    let entry = &queue[i];
                    if entry.worker.is_some_and(|w| w != worker) {
                        tickle_me = true;
                        i += 1;
                        continue;
                    }
                    if let Task::Fiber(fiber) = &entry.task {
                        if fiber.state() == FiberState::Running {
                            busy_skipped = true;
                            i += 1;
                            continue;
                        }
                    }
                    picked = queue.remove(i);
                    self.active.fetch_add(1, Ordering::AcqRel);
                    break;
                }
                tickle_me |= picked.is_some() && i < queue.len();
                picked
            };

            if tickle_me {
                self.tickle();
            }

            match picked.map(|entry| entry.task) {
                Some(Task::Fiber(fiber)) => {
                    if fiber.state() != FiberState::Term {
                        fiber.resume();
                    }
                    self.finish_task();
                }
                Some(Task::Call(cb)) => {
                    let fiber = match scratch.take() {
                        Some(fiber) => {
                            fiber.reset(cb);
                            fiber
                        }
                        None => Fiber::new(cb, self.config.stack_size, true),
                    };
                    let ended = fiber.resume();
                    self.finish_task();
                    // a callback that suspended is owned by whoever re-queues
                    // it; one that handed out its own handle is left alone
                    if ended == FiberState::Term && Arc::strong_count(&fiber) == 1 {
                        scratch = Some(fiber);
                    }
                }
                None => {
                    if busy_skipped {
                        thread::yield_now();
                        continue;
                    }
                    if idle_fiber.state() == FiberState::Term {
                        kdebug!("{} worker {} idle fiber done", self.name(), worker);
                        break;
                    }
                    self.idle.fetch_add(1, Ordering::AcqRel);
                    idle_fiber.resume();
                    self.idle.fetch_sub(1, Ordering::AcqRel);
                }
            }
        }

        if !on_root {
            tls::set_scheduler(None);
            tls::set_scheduler_fiber(std::ptr::null());
            tls::set_worker_id(usize::MAX);
        }
        tls::set_hook_enabled(false);
    }

    fn finish_task(&self) {
        let remaining = self.active.fetch_sub(1, Ordering::AcqRel) - 1;
        // the last busy worker wakes the parked ones so they can observe shutdown
        if remaining == 0 && self.is_stop_requested() && self.has_idle_threads() {
            self.tickle();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if self.started.load(Ordering::Acquire) && !self.stopping.load(Ordering::Acquire) {
            kwarn!("scheduler {} dropped without stop()", self.config.name);
        }
        if self.root_fiber.is_some() {
            self.release_caller();
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.config.name)
            .field("threads", &self.config.threads)
            .field("use_caller", &self.config.use_caller)
            .field("active", &self.active_count())
            .field("idle", &self.idle_count())
            .field("stopping", &self.is_stop_requested())
            .finish()
    }
}

/// Re-queue the running fiber and give up the thread
///
/// Outside a task fiber (or a scheduler) this yields the OS thread instead.
pub fn yield_now() {
    match Scheduler::current() {
        Some(sched) if Fiber::in_task_fiber() => {
            sched.schedule_fiber(Fiber::current());
            drop(sched);
            Fiber::yield_now();
        }
        _ => thread::yield_now(),
    }
}
