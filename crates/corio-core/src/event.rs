//! Read/write interest mask for descriptor registrations

use core::fmt;
use core::ops::{BitAnd, BitOr, BitOrAssign, Not, Sub};

/// Set of I/O interests on a descriptor
///
/// Bit values match `EPOLLIN` / `EPOLLOUT` so the reactor can pass them
/// through unchanged.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct Event(u32);

impl Event {
    pub const NONE: Event = Event(0x0);
    pub const READ: Event = Event(0x1);
    pub const WRITE: Event = Event(0x4);

    #[inline]
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Event(bits & (Self::READ.0 | Self::WRITE.0))
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn contains(self, other: Event) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn intersects(self, other: Event) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for Event {
    type Output = Event;
    #[inline]
    fn bitor(self, rhs: Event) -> Event {
        Event(self.0 | rhs.0)
    }
}

impl BitOrAssign for Event {
    #[inline]
    fn bitor_assign(&mut self, rhs: Event) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Event {
    type Output = Event;
    #[inline]
    fn bitand(self, rhs: Event) -> Event {
        Event(self.0 & rhs.0)
    }
}

impl Sub for Event {
    type Output = Event;
    #[inline]
    fn sub(self, rhs: Event) -> Event {
        Event(self.0 & !rhs.0)
    }
}

impl Not for Event {
    type Output = Event;
    #[inline]
    fn not(self) -> Event {
        Event::from_bits_truncate(!self.0)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.contains(Event::READ), self.contains(Event::WRITE)) {
            (false, false) => write!(f, "NONE"),
            (true, false) => write!(f, "READ"),
            (false, true) => write!(f, "WRITE"),
            (true, true) => write!(f, "READ|WRITE"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_ops() {
        let both = Event::READ | Event::WRITE;
        assert!(both.contains(Event::READ));
        assert!(both.contains(Event::WRITE));
        assert_eq!(both - Event::READ, Event::WRITE);
        assert_eq!(!Event::READ, Event::WRITE);
        assert!(!Event::NONE.contains(Event::NONE));
        assert!(Event::NONE.is_empty());
    }

    #[test]
    fn test_truncate_drops_foreign_bits() {
        // EPOLLERR | EPOLLIN
        assert_eq!(Event::from_bits_truncate(0x8 | 0x1), Event::READ);
        assert_eq!(format!("{:?}", Event::READ | Event::WRITE), "READ|WRITE");
    }
}
