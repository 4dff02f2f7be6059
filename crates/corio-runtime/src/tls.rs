//! Thread-local runtime context
//!
//! Per OS thread: which worker it is, which scheduler it belongs to, the
//! fiber currently running on it, the thread's implicit main fiber, the
//! fiber that runs the dispatch loop, and whether I/O hooking is on.
//!
//! Fibers migrate between threads, so a fiber must never hold on to a
//! thread-local address across a suspension point. Every accessor here is
//! `#[inline(never)]` so the compiler cannot cache the TLS base across a
//! context switch.

use crate::fiber::Fiber;
use crate::scheduler::Scheduler;
use std::cell::{Cell, RefCell};
use std::sync::{Arc, Weak};

thread_local! {
    /// Worker index within the owning scheduler
    static WORKER_ID: Cell<usize> = const { Cell::new(usize::MAX) };

    /// Fiber executing right now
    static CURRENT_FIBER: Cell<*const Fiber> = const { Cell::new(std::ptr::null()) };

    /// The thread's own (stackless) main fiber, created lazily
    static THREAD_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// Fiber running the dispatch loop on this thread
    static SCHEDULER_FIBER: Cell<*const Fiber> = const { Cell::new(std::ptr::null()) };

    static SCHEDULER: RefCell<Option<Weak<Scheduler>>> = const { RefCell::new(None) };

    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

#[inline(never)]
pub fn set_worker_id(id: usize) {
    WORKER_ID.with(|c| c.set(id));
}

/// `None` when the calling thread is not a scheduler worker
#[inline(never)]
pub fn worker_id() -> Option<usize> {
    let id = WORKER_ID.with(|c| c.get());
    (id != usize::MAX).then_some(id)
}

#[inline(never)]
pub(crate) fn current_fiber_ptr() -> *const Fiber {
    CURRENT_FIBER.with(|c| c.get())
}

#[inline(never)]
pub(crate) fn set_current_fiber(f: *const Fiber) {
    CURRENT_FIBER.with(|c| c.set(f));
    let id = if f.is_null() {
        0
    } else {
        unsafe { (*f).id().as_u64() }
    };
    corio_core::kprint::set_context_fiber(id);
}

#[inline(never)]
pub(crate) fn thread_fiber_ptr() -> *const Fiber {
    THREAD_FIBER.with(|c| c.borrow().as_ref().map_or(std::ptr::null(), Arc::as_ptr))
}

#[inline(never)]
pub(crate) fn set_thread_fiber(f: Arc<Fiber>) {
    THREAD_FIBER.with(|c| *c.borrow_mut() = Some(f));
}

#[inline(never)]
pub(crate) fn scheduler_fiber_ptr() -> *const Fiber {
    SCHEDULER_FIBER.with(|c| c.get())
}

#[inline(never)]
pub(crate) fn set_scheduler_fiber(f: *const Fiber) {
    SCHEDULER_FIBER.with(|c| c.set(f));
}

#[inline(never)]
pub(crate) fn set_scheduler(s: Option<Weak<Scheduler>>) {
    SCHEDULER.with(|c| *c.borrow_mut() = s);
}

#[inline(never)]
pub fn scheduler() -> Option<Arc<Scheduler>> {
    SCHEDULER.with(|c| c.borrow().as_ref().and_then(Weak::upgrade))
}

#[inline(never)]
pub(crate) fn scheduler_weak() -> Option<Weak<Scheduler>> {
    SCHEDULER.with(|c| c.borrow().clone())
}

/// Whether blocking-style calls on this thread should cooperate with the runtime
#[inline(never)]
pub fn is_hook_enabled() -> bool {
    HOOK_ENABLED.with(|c| c.get())
}

#[inline(never)]
pub fn set_hook_enabled(enabled: bool) {
    HOOK_ENABLED.with(|c| c.set(enabled));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_on_fresh_thread() {
        std::thread::spawn(|| {
            assert_eq!(worker_id(), None);
            assert!(current_fiber_ptr().is_null());
            assert!(scheduler().is_none());
            assert!(!is_hook_enabled());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_hook_flag_is_per_thread() {
        set_hook_enabled(true);
        let other = std::thread::spawn(is_hook_enabled).join().unwrap();
        assert!(is_hook_enabled());
        assert!(!other);
        set_hook_enabled(false);
    }
}
