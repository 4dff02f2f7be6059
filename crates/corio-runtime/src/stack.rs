//! Fiber stacks: anonymous mmap with a guard page at the low end

use corio_core::constants::GUARD_SIZE;
use corio_core::error::{RuntimeError, RuntimeResult};
use std::sync::OnceLock;

/// System page size; the guard is one page, never smaller than `GUARD_SIZE`.
pub fn page_size() -> usize {
    static PAGE: OnceLock<usize> = OnceLock::new();
    *PAGE.get_or_init(|| {
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if sz > 0 {
            (sz as usize).max(GUARD_SIZE)
        } else {
            GUARD_SIZE
        }
    })
}

/// An owned, mmap-backed stack
///
/// Layout (stack grows down):
///
/// ```text
/// base                base+page                               top
///  | guard (PROT_NONE) |  usable (PROT_READ | PROT_WRITE)       |
/// ```
pub struct Stack {
    base: *mut u8,
    mapped: usize,
    guard: usize,
}

// The mapping is owned exclusively; only the fiber running on it touches it.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

impl Stack {
    /// Map a stack with at least `size` usable bytes (rounded up to pages).
    pub fn new(size: usize) -> RuntimeResult<Self> {
        let page = page_size();
        let usable = size.div_ceil(page) * page;
        let mapped = usable + page;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapped,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(RuntimeError::last_os_error());
        }

        // Overflow runs into the guard and faults instead of corrupting memory
        let ret = unsafe { libc::mprotect(base, page, libc::PROT_NONE) };
        if ret != 0 {
            let err = RuntimeError::last_os_error();
            unsafe {
                libc::munmap(base, mapped);
            }
            return Err(err);
        }

        Ok(Self {
            base: base as *mut u8,
            mapped,
            guard: page,
        })
    }

    /// Highest address of the stack; the initial stack pointer derives from it.
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.mapped) }
    }

    #[inline]
    pub fn usable_size(&self) -> usize {
        self.mapped - self.guard
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        let ret = unsafe { libc::munmap(self.base as *mut libc::c_void, self.mapped) };
        if ret != 0 {
            corio_core::kerror!(
                "munmap of fiber stack failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_rounding_and_alignment() {
        let page = page_size();
        let stack = Stack::new(page + 1).unwrap();
        assert_eq!(stack.usable_size(), 2 * page);
        assert_eq!(stack.top() as usize % page, 0);
    }

    #[test]
    fn test_stack_is_writable() {
        let stack = Stack::new(16 * 1024).unwrap();
        unsafe {
            let p = stack.top().sub(8);
            p.write(0xAB);
            assert_eq!(p.read(), 0xAB);
            // lowest usable byte, just above the guard
            let low = stack.top().sub(stack.usable_size());
            low.write(1);
            assert_eq!(low.read(), 1);
        }
    }
}
