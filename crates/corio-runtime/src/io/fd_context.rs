//! Per-descriptor interest records

use crate::fiber::Fiber;
use crate::scheduler::Scheduler;
use corio_core::{kfatal, kwarn, Event};
use parking_lot::Mutex;
use std::os::fd::RawFd;
use std::sync::{Arc, Weak};

/// Callback stored for an event registration
pub type EventCallback = Box<dyn FnOnce() + Send + 'static>;

/// What to run when one event on one descriptor fires
#[derive(Default)]
pub(crate) struct EventContext {
    pub scheduler: Option<Weak<Scheduler>>,
    pub fiber: Option<Arc<Fiber>>,
    pub callback: Option<EventCallback>,
}

impl EventContext {
    fn is_empty(&self) -> bool {
        self.scheduler.is_none() && self.fiber.is_none() && self.callback.is_none()
    }

    /// Hand the stored fiber or callback to its scheduler
    fn dispatch(self, fd: RawFd, event: Event) {
        let Some(sched) = self.scheduler.as_ref().and_then(Weak::upgrade) else {
            kwarn!("fd {} {:?} fired after its scheduler was dropped", fd, event);
            return;
        };
        if let Some(cb) = self.callback {
            sched.schedule(cb);
        } else if let Some(fiber) = self.fiber {
            sched.schedule_fiber(fiber);
        }
    }
}

pub(crate) struct FdState {
    /// Registered interests
    pub events: Event,
    pub read: EventContext,
    pub write: EventContext,
}

impl FdState {
    pub fn context_mut(&mut self, event: Event) -> &mut EventContext {
        if event == Event::READ {
            &mut self.read
        } else if event == Event::WRITE {
            &mut self.write
        } else {
            kfatal!("no event context for {:?}", event)
        }
    }

    /// Forget a registration without running it
    pub fn clear(&mut self, event: Event) -> EventContext {
        self.events = self.events - event;
        std::mem::take(self.context_mut(event))
    }

    /// Consume a registration and schedule its target
    pub fn trigger(&mut self, fd: RawFd, event: Event) {
        if !self.events.contains(event) {
            kfatal!("fd {} trigger of unregistered {:?} (registered {:?})", fd, event, self.events);
        }
        let ctx = self.clear(event);
        if ctx.is_empty() {
            kfatal!("fd {} {:?} registered without a target", fd, event);
        }
        ctx.dispatch(fd, event);
    }
}

/// Interest record for one file descriptor
///
/// The table owning these only ever grows, so a context stays valid for
/// the reactor's lifetime even after its descriptor is closed and reused.
pub struct FdContext {
    fd: RawFd,
    pub(crate) state: Mutex<FdState>,
}

impl FdContext {
    pub(crate) fn new(fd: RawFd) -> Self {
        Self {
            fd,
            state: Mutex::new(FdState {
                events: Event::NONE,
                read: EventContext::default(),
                write: EventContext::default(),
            }),
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Currently registered interests
    pub fn events(&self) -> Event {
        self.state.lock().events
    }
}
