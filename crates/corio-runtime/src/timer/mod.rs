//! Timer subsystem
//!
//! A `TimerManager` keeps live timers ordered by `(deadline, id)`. The id
//! comes from a global counter, so the order is total and timers with
//! equal deadlines fire in creation order.
//!
//! ```text
//!   add_timer ──► BTreeMap<(deadline_ms, id), entry> ──► list_expired()
//!        │                                                    │
//!        └── new earliest deadline? ──► front hook (wake the  │
//!                                       readiness wait)       ▼
//!                                              callbacks, ascending deadline
//! ```
//!
//! The manager never runs callbacks itself; `list_expired` hands them to
//! the caller (the reactor schedules each one as a task).

mod clock;

pub use clock::{Clock, ManualClock, MonotonicClock};

use corio_core::constants::CLOCK_ROLLBACK_MS;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Expired-timer callback; recurring timers hand out the same callback every period
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

type FrontHook = Arc<dyn Fn() + Send + Sync>;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

struct TimerEntry {
    period_ms: u64,
    recurring: bool,
    cb: TimerCallback,
}

struct TimerSet {
    by_deadline: BTreeMap<(u64, u64), TimerEntry>,
    /// id -> deadline, to find an entry from its handle
    deadlines: HashMap<u64, u64>,
    /// A front-insertion wake is already in flight
    tickled: bool,
    /// Last "now" seen by `list_expired`, for rollback detection
    previous_ms: u64,
}

impl TimerSet {
    /// Insert and report whether the front hook should fire
    fn insert(&mut self, id: u64, deadline: u64, entry: TimerEntry) -> bool {
        self.by_deadline.insert((deadline, id), entry);
        self.deadlines.insert(id, deadline);
        let at_front = self.by_deadline.keys().next() == Some(&(deadline, id)) && !self.tickled;
        if at_front {
            self.tickled = true;
        }
        at_front
    }

    fn take(&mut self, id: u64) -> Option<(u64, TimerEntry)> {
        let deadline = self.deadlines.remove(&id)?;
        self.by_deadline.remove(&(deadline, id)).map(|e| (deadline, e))
    }
}

struct Shared {
    set: RwLock<TimerSet>,
    clock: Arc<dyn Clock>,
    front_hook: RwLock<Option<FrontHook>>,
}

impl Shared {
    fn notify_front(&self) {
        let hook = self.front_hook.read().clone();
        if let Some(hook) = hook {
            hook();
        }
    }
}

/// Ordered set of deadline callbacks
#[derive(Clone)]
pub struct TimerManager {
    shared: Arc<Shared>,
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerManager {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(MonotonicClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_ms();
        Self {
            shared: Arc::new(Shared {
                set: RwLock::new(TimerSet {
                    by_deadline: BTreeMap::new(),
                    deadlines: HashMap::new(),
                    tickled: false,
                    previous_ms: now,
                }),
                clock,
                front_hook: RwLock::new(None),
            }),
        }
    }

    /// Called (outside the timer lock) when a timer becomes the earliest
    /// deadline while no earlier wake is pending.
    pub fn set_front_hook<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.shared.front_hook.write() = Some(Arc::new(hook));
    }

    #[inline]
    pub fn now_ms(&self) -> u64 {
        self.shared.clock.now_ms()
    }

    /// Fire `cb` after `ms` milliseconds (every `ms` if `recurring`)
    pub fn add_timer<F>(&self, ms: u64, cb: F, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed);
        let deadline = self.now_ms().saturating_add(ms);
        let entry = TimerEntry {
            period_ms: ms,
            recurring,
            cb: Arc::new(cb),
        };
        let at_front = self.shared.set.write().insert(id, deadline, entry);
        if at_front {
            self.shared.notify_front();
        }
        Timer {
            id,
            manager: Arc::downgrade(&self.shared),
        }
    }

    /// Like `add_timer`, but `cb` only runs while `guard` is still alive
    pub fn add_condition_timer<F, T>(&self, ms: u64, cb: F, guard: Weak<T>, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
        T: ?Sized + Send + Sync + 'static,
    {
        self.add_timer(
            ms,
            move || {
                if guard.upgrade().is_some() {
                    cb();
                }
            },
            recurring,
        )
    }

    /// Milliseconds until the earliest deadline (0 if already due), `None` if empty.
    ///
    /// Also re-arms the front hook.
    pub fn next_timer(&self) -> Option<u64> {
        let mut set = self.shared.set.write();
        set.tickled = false;
        let &(deadline, _) = set.by_deadline.keys().next()?;
        Some(deadline.saturating_sub(self.now_ms()))
    }

    /// Remove every due timer and return their callbacks in deadline order.
    ///
    /// Recurring timers are re-inserted at `now + period`. If the clock
    /// jumped back by more than an hour since the last call, every timer
    /// counts as due.
    pub fn list_expired(&self) -> Vec<TimerCallback> {
        let now = self.now_ms();
        let mut set = self.shared.set.write();

        let rollover = now < set.previous_ms.saturating_sub(CLOCK_ROLLBACK_MS);
        set.previous_ms = now;

        let expired = match set.by_deadline.keys().next() {
            None => return Vec::new(),
            Some(_) if rollover => std::mem::take(&mut set.by_deadline),
            Some(&(first, _)) if first > now => return Vec::new(),
            Some(_) => {
                let rest = set.by_deadline.split_off(&(now.saturating_add(1), 0));
                std::mem::replace(&mut set.by_deadline, rest)
            }
        };

        let mut cbs = Vec::with_capacity(expired.len());
        for ((_, id), entry) in expired {
            cbs.push(entry.cb.clone());
            if entry.recurring {
                let next = now.saturating_add(entry.period_ms);
                set.deadlines.insert(id, next);
                set.by_deadline.insert((next, id), entry);
            } else {
                set.deadlines.remove(&id);
            }
        }
        cbs
    }

    pub fn has_timer(&self) -> bool {
        !self.shared.set.read().by_deadline.is_empty()
    }

    pub fn len(&self) -> usize {
        self.shared.set.read().by_deadline.len()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_timer()
    }
}

/// Handle to a timer registered with a `TimerManager`
///
/// All operations fail (return `false`) once the timer has fired (one-shot),
/// been cancelled, or its manager is gone.
#[derive(Clone)]
pub struct Timer {
    id: u64,
    manager: Weak<Shared>,
}

impl Timer {
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel(&self) -> bool {
        let Some(shared) = self.manager.upgrade() else {
            return false;
        };
        let removed = shared.set.write().take(self.id).is_some();
        removed
    }

    /// Restart the countdown: deadline becomes now + period
    pub fn refresh(&self) -> bool {
        let Some(shared) = self.manager.upgrade() else {
            return false;
        };
        let mut set = shared.set.write();
        let Some((_, entry)) = set.take(self.id) else {
            return false;
        };
        let next = shared.clock.now_ms().saturating_add(entry.period_ms);
        set.by_deadline.insert((next, self.id), entry);
        set.deadlines.insert(self.id, next);
        true
    }

    /// Change the period to `ms`.
    ///
    /// With `from_now` the new deadline is now + ms, otherwise it keeps
    /// the original start: old deadline - old period + ms.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        let Some(shared) = self.manager.upgrade() else {
            return false;
        };
        let mut set = shared.set.write();
        let Some(&deadline) = set.deadlines.get(&self.id) else {
            return false;
        };
        let unchanged = set
            .by_deadline
            .get(&(deadline, self.id))
            .is_some_and(|e| e.period_ms == ms);
        if unchanged && !from_now {
            return true;
        }
        let Some((deadline, mut entry)) = set.take(self.id) else {
            return false;
        };
        let start = if from_now {
            shared.clock.now_ms()
        } else {
            deadline.saturating_sub(entry.period_ms)
        };
        entry.period_ms = ms;
        let at_front = set.insert(self.id, start.saturating_add(ms), entry);
        drop(set);
        if at_front {
            shared.notify_front();
        }
        true
    }

    /// Still registered (not fired-and-removed, not cancelled)
    pub fn is_pending(&self) -> bool {
        self.deadline_ms().is_some()
    }

    /// Absolute deadline in manager-clock milliseconds
    pub fn deadline_ms(&self) -> Option<u64> {
        let shared = self.manager.upgrade()?;
        let deadline = shared.set.read().deadlines.get(&self.id).copied();
        deadline
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("id", &self.id)
            .field("deadline_ms", &self.deadline_ms())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    fn manual(start: u64) -> (TimerManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start));
        (TimerManager::with_clock(clock.clone()), clock)
    }

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> Box<dyn Fn() + Send + Sync>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        let make = move |tag: &'static str| -> Box<dyn Fn() + Send + Sync> {
            let l = l.clone();
            Box::new(move || l.lock().push(tag))
        };
        (log, make)
    }

    fn run(cbs: Vec<TimerCallback>) {
        for cb in cbs {
            cb();
        }
    }

    #[test]
    fn test_expired_in_deadline_order() {
        let (tm, clock) = manual(1000);
        let (log, make) = recorder();
        tm.add_timer(30, make("c"), false);
        tm.add_timer(10, make("a"), false);
        tm.add_timer(20, make("b"), false);

        clock.advance(15);
        run(tm.list_expired());
        assert_eq!(*log.lock(), vec!["a"]);

        clock.advance(100);
        run(tm.list_expired());
        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
        assert!(!tm.has_timer());
    }

    #[test]
    fn test_equal_deadlines_fire_in_creation_order() {
        let (tm, clock) = manual(0);
        let (log, make) = recorder();
        tm.add_timer(5, make("first"), false);
        tm.add_timer(5, make("second"), false);
        tm.add_timer(5, make("third"), false);
        clock.set(5);
        run(tm.list_expired());
        assert_eq!(*log.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_front_hook_once_per_wait() {
        let (tm, _clock) = manual(0);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        tm.set_front_hook(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        tm.add_timer(100, || {}, false);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        // earlier again, but a wake is already pending
        tm.add_timer(50, || {}, false);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        // the waiter recomputed its budget
        assert_eq!(tm.next_timer(), Some(50));
        tm.add_timer(200, || {}, false);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        tm.add_timer(10, || {}, false);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_recurring_reinserted_at_fire_time_plus_period() {
        let (tm, clock) = manual(0);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let timer = tm.add_timer(
            100,
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            true,
        );

        clock.set(100);
        run(tm.list_expired());
        assert_eq!(timer.deadline_ms(), Some(200));

        // fired late: next deadline counts from the firing time
        clock.set(250);
        run(tm.list_expired());
        assert_eq!(timer.deadline_ms(), Some(350));
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        assert!(timer.cancel());
        clock.set(10_000);
        assert!(tm.list_expired().is_empty());
        assert!(!timer.cancel());
    }

    #[test]
    fn test_condition_timer_skips_dead_guard() {
        let (tm, clock) = manual(0);
        let hits = Arc::new(AtomicUsize::new(0));
        let guard = Arc::new(());
        let h = hits.clone();
        tm.add_condition_timer(
            10,
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            Arc::downgrade(&guard),
            false,
        );
        let h = hits.clone();
        let dead = Arc::new(());
        tm.add_condition_timer(
            10,
            move || {
                h.fetch_add(100, Ordering::SeqCst);
            },
            Arc::downgrade(&dead),
            false,
        );
        drop(dead);

        clock.set(10);
        let cbs = tm.list_expired();
        assert_eq!(cbs.len(), 2);
        run(cbs);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_next_timer_never_negative() {
        let (tm, clock) = manual(0);
        assert_eq!(tm.next_timer(), None);
        tm.add_timer(100, || {}, false);
        assert_eq!(tm.next_timer(), Some(100));
        clock.set(150);
        assert_eq!(tm.next_timer(), Some(0));
    }

    #[test]
    fn test_clock_rollback_expires_everything() {
        let hour = 60 * 60 * 1000;
        let (tm, clock) = manual(10 * hour);
        tm.add_timer(5 * hour, || {}, false);
        tm.add_timer(6 * hour, || {}, false);
        assert!(tm.list_expired().is_empty());

        // half an hour back is tolerated
        clock.set(10 * hour - hour / 2);
        assert!(tm.list_expired().is_empty());

        clock.set(10 * hour - 2 * hour);
        assert_eq!(tm.list_expired().len(), 2);
        assert!(!tm.has_timer());
    }

    #[test]
    fn test_refresh_and_reset() {
        let (tm, clock) = manual(1000);
        let timer = tm.add_timer(100, || {}, false);
        assert_eq!(timer.deadline_ms(), Some(1100));

        clock.set(1050);
        assert!(timer.refresh());
        assert_eq!(timer.deadline_ms(), Some(1150));

        // keep the start (1050), new period
        assert!(timer.reset(300, false));
        assert_eq!(timer.deadline_ms(), Some(1350));
        // same period, not from now: nothing to do
        assert!(timer.reset(300, false));
        assert_eq!(timer.deadline_ms(), Some(1350));

        clock.set(2000);
        assert!(timer.reset(10, true));
        assert_eq!(timer.deadline_ms(), Some(2010));

        assert!(timer.cancel());
        assert!(!timer.refresh());
        assert!(!timer.reset(5, true));
        assert!(!timer.is_pending());
    }

    #[test]
    fn test_handle_outlives_manager() {
        let (tm, _clock) = manual(0);
        let timer = tm.add_timer(10, || {}, false);
        drop(tm);
        assert!(!timer.cancel());
        assert!(!timer.refresh());
        assert_eq!(timer.deadline_ms(), None);
    }
}
