//! Fiber identifier type

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide fiber id counter. Zero is reserved for "no fiber".
static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a fiber
///
/// Ids are handed out from a monotonically increasing process-wide
/// counter and never reused. `FiberId::NONE` (0) is what a thread reports
/// before it has entered any fiber.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct FiberId(u64);

impl FiberId {
    /// Sentinel value indicating no fiber
    pub const NONE: FiberId = FiberId(0);

    /// Allocate the next id from the global counter
    #[inline]
    pub fn next() -> Self {
        FiberId(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub const fn from_raw(id: u64) -> Self {
        FiberId(id)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl From<FiberId> for u64 {
    #[inline]
    fn from(id: FiberId) -> Self {
        id.0
    }
}

impl fmt::Debug for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "FiberId(NONE)")
        } else {
            write!(f, "FiberId({})", self.0)
        }
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_increase() {
        let a = FiberId::next();
        let b = FiberId::next();
        assert!(b > a);
        assert!(!a.is_none());
    }

    #[test]
    fn test_none() {
        assert!(FiberId::NONE.is_none());
        assert_eq!(FiberId::default(), FiberId::NONE);
        assert_eq!(u64::from(FiberId::from_raw(7)), 7);
        assert_eq!(format!("{:?}", FiberId::NONE), "FiberId(NONE)");
    }
}
