//! Stackful fibers
//!
//! A `Fiber` is an independent execution context with its own mmap'd
//! stack, switched cooperatively with `resume()` / `Fiber::yield_now()`.
//! Each OS thread also gets an implicit, stackless "thread fiber" that
//! stands for the thread itself.
//!
//! # Switch protocol
//!
//! A fiber that yields or finishes stays `Running` until the switch away
//! from it has completed; the resumer then publishes `Ready` or `Term`
//! before `resume()` returns. A fiber handle that another thread has
//! already re-queued therefore can never be resumed, reset or reused while
//! its registers are still being saved: the dispatch loop skips `Running`
//! fibers, and only the resumer that saw the final switch learns of `Term`.

use crate::arch::{self, SavedRegs};
use crate::stack::Stack;
use crate::tls;
use corio_core::constants::{DEFAULT_STACK_SIZE, MIN_STACK_SIZE};
use corio_core::error::RuntimeResult;
use corio_core::{kfatal, ktrace, FiberId, FiberState};
use std::cell::UnsafeCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Body of a task fiber
pub type FiberFn = Box<dyn FnOnce() + Send + 'static>;

/// Live fibers in the process (diagnostic only)
static TOTAL_FIBERS: AtomicU64 = AtomicU64::new(0);

pub struct Fiber {
    id: FiberId,
    state: AtomicU8,
    /// Has been resumed at least once since creation / last reset
    started: AtomicBool,
    /// Body returned; set on the fiber's own stack, read by its resumer
    finished: AtomicBool,
    regs: UnsafeCell<SavedRegs>,
    /// `None` for a thread fiber
    stack: Option<Stack>,
    entry: UnsafeCell<Option<FiberFn>>,
    /// Yield back to the thread's dispatch fiber rather than the thread fiber
    run_in_scheduler: bool,
}

// `regs` and `entry` are only touched by the thread that currently owns
// the fiber: the one resuming it or the one it runs on.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a task fiber. Failure to set up the stack is fatal.
    ///
    /// `stack_size == 0` selects the default size.
    pub fn new<F>(f: F, stack_size: usize, run_in_scheduler: bool) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        match Self::try_new(f, stack_size, run_in_scheduler) {
            Ok(fiber) => fiber,
            Err(e) => kfatal!("fiber creation failed: {}", e),
        }
    }

    pub fn try_new<F>(f: F, stack_size: usize, run_in_scheduler: bool) -> RuntimeResult<Arc<Fiber>>
    where
        F: FnOnce() + Send + 'static,
    {
        let size = if stack_size == 0 {
            DEFAULT_STACK_SIZE
        } else {
            stack_size.max(MIN_STACK_SIZE)
        };
        let stack = Stack::new(size)?;

        let fiber = Arc::new(Fiber {
            id: FiberId::next(),
            state: AtomicU8::new(FiberState::Ready as u8),
            started: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            regs: UnsafeCell::new(SavedRegs::default()),
            stack: Some(stack),
            entry: UnsafeCell::new(Some(Box::new(f))),
            run_in_scheduler,
        });
        // The context captures the fiber's address, which is stable once boxed in the Arc
        fiber.init_context();
        TOTAL_FIBERS.fetch_add(1, Ordering::Relaxed);
        ktrace!("fiber {} created, stack {} bytes", fiber.id, size);
        Ok(fiber)
    }

    fn new_thread_fiber() -> Arc<Fiber> {
        TOTAL_FIBERS.fetch_add(1, Ordering::Relaxed);
        Arc::new(Fiber {
            id: FiberId::next(),
            state: AtomicU8::new(FiberState::Running as u8),
            started: AtomicBool::new(true),
            finished: AtomicBool::new(false),
            regs: UnsafeCell::new(SavedRegs::default()),
            stack: None,
            entry: UnsafeCell::new(None),
            run_in_scheduler: false,
        })
    }

    fn init_context(&self) {
        if let Some(stack) = &self.stack {
            unsafe {
                arch::init_context(
                    &mut *self.regs.get(),
                    stack.top(),
                    fiber_main,
                    self as *const Fiber as usize,
                );
            }
        }
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    fn set_state(&self, s: FiberState) {
        self.state.store(s as u8, Ordering::Release);
    }

    /// True for task fibers, false for a thread's implicit fiber
    #[inline]
    pub fn has_stack(&self) -> bool {
        self.stack.is_some()
    }

    /// Reuse this fiber's stack for a new body.
    ///
    /// Only legal on a terminated fiber or one that has never been resumed.
    pub fn reset<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.stack.is_none() {
            kfatal!("reset of thread fiber {}", self.id);
        }
        let st = self.state();
        let fresh = st == FiberState::Ready && !self.started.load(Ordering::Acquire);
        if st != FiberState::Term && !fresh {
            kfatal!("reset of fiber {} in state {}", self.id, st);
        }
        unsafe {
            *self.entry.get() = Some(Box::new(f));
        }
        self.init_context();
        self.started.store(false, Ordering::Release);
        self.finished.store(false, Ordering::Release);
        self.set_state(FiberState::Ready);
    }

    /// Switch into this fiber. Returns once it yields or terminates.
    ///
    /// Must be called from the context this fiber yields back to: the
    /// thread's dispatch fiber for scheduler fibers, the thread fiber
    /// otherwise. The result is the state this switch ended in: `Term`
    /// only for the resumer the body returned to, `Ready` after a yield
    /// (even if another thread has resumed the fiber since).
    pub fn resume(&self) -> FiberState {
        let back = back_fiber(self.run_in_scheduler);
        let current = tls::current_fiber_ptr();
        if !std::ptr::eq(current, back) {
            kfatal!(
                "fiber {} resumed from fiber {} instead of its return context",
                self.id,
                Fiber::current_id()
            );
        }
        if self
            .state
            .compare_exchange(
                FiberState::Ready as u8,
                FiberState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            kfatal!("resume of fiber {} in state {}", self.id, self.state());
        }
        self.started.store(true, Ordering::Release);

        tls::set_current_fiber(self);
        unsafe {
            arch::context_switch((*back).regs.get(), self.regs.get());
        }

        // Registers are saved now; let other threads pick it up
        if self.finished.swap(false, Ordering::AcqRel) {
            self.set_state(FiberState::Term);
            return FiberState::Term;
        }
        if self
            .state
            .compare_exchange(
                FiberState::Running as u8,
                FiberState::Ready as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            kfatal!("fiber {} left Running while switching out", self.id);
        }
        FiberState::Ready
    }

    /// Suspend the calling task fiber and return to whoever resumed it.
    ///
    /// Nothing re-schedules the fiber; the caller must have arranged for
    /// that (an event registration, a timer, or an explicit `schedule`).
    pub fn yield_now() {
        let cur = tls::current_fiber_ptr();
        if cur.is_null() {
            kfatal!("yield outside of any fiber");
        }
        let fiber = unsafe { &*cur };
        if fiber.stack.is_none() {
            kfatal!("thread fiber {} cannot yield", fiber.id);
        }
        let st = fiber.state();
        if st != FiberState::Running {
            kfatal!("yield of fiber {} in state {}", fiber.id, st);
        }
        fiber.switch_out();
    }

    fn switch_out(&self) {
        let back = back_fiber(self.run_in_scheduler);
        tls::set_current_fiber(back);
        unsafe {
            arch::context_switch(self.regs.get(), (*back).regs.get());
        }
    }

    /// The fiber running on this thread, creating the thread fiber on first use
    pub fn current() -> Arc<Fiber> {
        let ptr = tls::current_fiber_ptr();
        if ptr.is_null() {
            let main = Fiber::new_thread_fiber();
            tls::set_thread_fiber(main.clone());
            tls::set_current_fiber(Arc::as_ptr(&main));
            return main;
        }
        // Every fiber reachable from TLS is owned by an Arc kept alive by
        // its resumer (or by THREAD_FIBER)
        unsafe {
            Arc::increment_strong_count(ptr);
            Arc::from_raw(ptr)
        }
    }

    /// Id of the running fiber, `FiberId::NONE` before any fiber exists on this thread
    pub fn current_id() -> FiberId {
        let ptr = tls::current_fiber_ptr();
        if ptr.is_null() {
            FiberId::NONE
        } else {
            unsafe { (*ptr).id }
        }
    }

    /// True when the caller runs on a task fiber (and may therefore yield)
    pub fn in_task_fiber() -> bool {
        let ptr = tls::current_fiber_ptr();
        !ptr.is_null() && unsafe { (*ptr).stack.is_some() }
    }

    pub fn total_fibers() -> u64 {
        TOTAL_FIBERS.load(Ordering::Relaxed)
    }
}

/// Context a fiber returns to on this thread
fn back_fiber(run_in_scheduler: bool) -> *const Fiber {
    if run_in_scheduler {
        let s = tls::scheduler_fiber_ptr();
        if !s.is_null() {
            return s;
        }
    }
    let t = tls::thread_fiber_ptr();
    if !t.is_null() {
        return t;
    }
    let main = Fiber::current();
    Arc::as_ptr(&main)
}

extern "C" fn fiber_main(arg: usize) -> ! {
    let fiber = unsafe { &*(arg as *const Fiber) };
    let entry = unsafe { (*fiber.entry.get()).take() };

    if let Some(f) = entry {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
            let msg = payload
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
                .unwrap_or("non-string panic payload");
            kfatal!("fiber {} panicked: {}", fiber.id, msg);
        }
    }

    // the resumer publishes Term once this stack is no longer in use
    fiber.finished.store(true, Ordering::Release);
    fiber.switch_out();
    kfatal!("terminated fiber {} was resumed", fiber.id)
}

impl Drop for Fiber {
    fn drop(&mut self) {
        TOTAL_FIBERS.fetch_sub(1, Ordering::Relaxed);
        if self.stack.is_some() && *self.started.get_mut() && self.state() != FiberState::Term {
            kfatal!("fiber {} dropped in state {} with a live stack", self.id, self.state());
        }
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("has_stack", &self.stack.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_resume_yield_terminate() {
        let steps = Arc::new(AtomicUsize::new(0));
        let s = steps.clone();
        let fiber = Fiber::new(
            move || {
                s.fetch_add(1, Ordering::SeqCst);
                Fiber::yield_now();
                s.fetch_add(1, Ordering::SeqCst);
            },
            0,
            false,
        );

        assert_eq!(fiber.state(), FiberState::Ready);
        assert_eq!(fiber.resume(), FiberState::Ready);
        assert_eq!(steps.load(Ordering::SeqCst), 1);
        assert_eq!(fiber.state(), FiberState::Ready);
        assert_eq!(fiber.resume(), FiberState::Term);
        assert_eq!(steps.load(Ordering::SeqCst), 2);
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_current_id_inside_and_outside() {
        std::thread::spawn(|| {
            assert_eq!(Fiber::current_id(), FiberId::NONE);
            let main = Fiber::current();
            assert!(!main.has_stack());
            assert_eq!(Fiber::current_id(), main.id());
            assert!(!Fiber::in_task_fiber());

            let seen = Arc::new(AtomicU64::new(0));
            let s = seen.clone();
            let fiber = Fiber::new(
                move || {
                    s.store(Fiber::current_id().as_u64(), Ordering::SeqCst);
                    assert!(Fiber::in_task_fiber());
                    assert_eq!(Fiber::current().state(), FiberState::Running);
                },
                0,
                false,
            );
            fiber.resume();
            assert_eq!(seen.load(Ordering::SeqCst), fiber.id().as_u64());
            assert_eq!(Fiber::current_id(), main.id());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_reset_reuses_stack() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let fiber = Fiber::new(move || { h.fetch_add(1, Ordering::SeqCst); }, 0, false);
        let id = fiber.id();
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);

        let h = hits.clone();
        fiber.reset(move || { h.fetch_add(10, Ordering::SeqCst); });
        assert_eq!(fiber.state(), FiberState::Ready);
        assert_eq!(fiber.id(), id);
        fiber.resume();
        assert_eq!(hits.load(Ordering::SeqCst), 11);
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_state_stays_running_until_switched_out() {
        // the body's last observation of itself is still Running: Term is
        // only published by the resumer after the final switch
        let last_seen = Arc::new(AtomicU8::new(u8::MAX));
        let l = last_seen.clone();
        let fiber = Fiber::new(
            move || {
                let me = Fiber::current();
                Fiber::yield_now();
                l.store(me.state() as u8, Ordering::SeqCst);
            },
            0,
            false,
        );
        assert_eq!(fiber.resume(), FiberState::Ready);
        assert_eq!(fiber.resume(), FiberState::Term);
        assert_eq!(last_seen.load(Ordering::SeqCst), FiberState::Running as u8);
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_unstarted_fiber_can_be_dropped() {
        let fiber = Fiber::new(|| {}, 0, false);
        // other tests create fibers concurrently, so only a loose check
        assert!(Fiber::total_fibers() >= 1);
        assert_eq!(fiber.state(), FiberState::Ready);
        drop(fiber);
    }

    #[test]
    fn test_nested_stack_usage() {
        fn depth(n: u64) -> u64 {
            let buf = [n as u8; 256];
            if n == 0 { buf[0] as u64 } else { depth(n - 1) + buf[1] as u64 }
        }
        let out = Arc::new(AtomicU64::new(0));
        let o = out.clone();
        let fiber = Fiber::new(move || { o.store(depth(100), Ordering::SeqCst); }, 64 * 1024, false);
        fiber.resume();
        assert_eq!(out.load(Ordering::SeqCst), (1..=100u64).map(|n| n as u8 as u64).sum());
    }
}
