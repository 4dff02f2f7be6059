//! Fiber state type

use core::fmt;

/// State of a fiber
///
/// There is no blocked state: a suspended fiber is simply one that nobody
/// has scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Created or yielded, may be resumed
    Ready = 0,

    /// Executing on some thread (or still switching out)
    Running = 1,

    /// Callback returned, stack may be reset or freed
    Term = 2,
}

impl FiberState {
    /// Decode from the raw byte stored in the fiber's atomic
    #[inline]
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => FiberState::Ready,
            1 => FiberState::Running,
            _ => FiberState::Term,
        }
    }

    #[inline]
    pub fn as_str(self) -> &'static str {
        match self {
            FiberState::Ready => "READY",
            FiberState::Running => "RUNNING",
            FiberState::Term => "TERM",
        }
    }
}

impl fmt::Display for FiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_roundtrip() {
        for s in [FiberState::Ready, FiberState::Running, FiberState::Term] {
            assert_eq!(FiberState::from_u8(s as u8), s);
        }
        assert_eq!(FiberState::from_u8(200), FiberState::Term);
        assert_eq!(FiberState::Running.to_string(), "RUNNING");
    }
}
