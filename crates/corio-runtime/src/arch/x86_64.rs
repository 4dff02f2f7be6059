//! x86_64 (System V) context switching

use super::EntryFn;
use std::arch::naked_asm;

/// MXCSR after reset: all exceptions masked, round to nearest
const MXCSR_DEFAULT: u32 = 0x1F80;
/// x87 control word after `finit`
const FPU_CW_DEFAULT: u16 = 0x037F;

/// Callee-saved state of a suspended context
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SavedRegs {
    pub rsp: u64, // 0x00
    pub rip: u64, // 0x08
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
    pub mxcsr: u32, // 0x40
    pub fpu_cw: u16, // 0x44
}

/// Prepare `regs` so that switching to it runs `entry(arg)` on the given stack.
///
/// # Safety
///
/// `stack_top` must be the upper end of a mapped, writable stack that
/// outlives the context.
#[inline]
pub unsafe fn init_context(regs: &mut SavedRegs, stack_top: *mut u8, entry: EntryFn, arg: usize) {
    // The trampoline issues `call`, which pushes 8 bytes; starting from a
    // 16-byte aligned rsp gives the callee the ABI-mandated rsp+8 alignment.
    let sp = (stack_top as usize) & !0xF;

    *regs = SavedRegs {
        rsp: sp as u64,
        rip: fiber_trampoline as usize as u64,
        r12: entry as usize as u64,
        r13: arg as u64,
        mxcsr: MXCSR_DEFAULT,
        fpu_cw: FPU_CW_DEFAULT,
        ..SavedRegs::default()
    };
}

#[unsafe(naked)]
unsafe extern "C" fn fiber_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        // entry never returns
        "ud2",
    );
}

/// Save callee-saved registers into `old`, load them from `new`, jump.
///
/// Returns when some other context switches back into `old`.
///
/// # Safety
///
/// `new` must hold a context produced by `init_context` or a previous
/// `context_switch`, whose stack is still alive.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_old: *mut SavedRegs, _new: *const SavedRegs) {
    naked_asm!(
        // Save into old (rdi)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        "stmxcsr dword ptr [rdi + 0x40]",
        "fnstcw word ptr [rdi + 0x44]",
        // Load from new (rsi)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "ldmxcsr dword ptr [rsi + 0x40]",
        "fldcw word ptr [rsi + 0x44]",
        "jmp rax",
        // Resumed: rsp points at our caller's return address
        "1:",
        "ret",
    );
}

#[cfg(test)]
mod tests {
    use crate::fiber::Fiber;
    use std::arch::asm;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn mxcsr() -> u32 {
        let mut v = 0u32;
        unsafe { asm!("stmxcsr dword ptr [{}]", in(reg) &mut v as *mut u32, options(nostack)) };
        v
    }

    fn set_mxcsr(v: u32) {
        unsafe { asm!("ldmxcsr dword ptr [{}]", in(reg) &v as *const u32, options(nostack)) };
    }

    #[test]
    fn test_mxcsr_is_per_context() {
        std::thread::spawn(|| {
            let outer = mxcsr();
            let seen = Arc::new(AtomicU32::new(0));
            let s = seen.clone();
            let fiber = Fiber::new(
                move || {
                    // round toward zero inside the fiber only
                    set_mxcsr(mxcsr() | 0x6000);
                    Fiber::yield_now();
                    s.store(mxcsr(), Ordering::SeqCst);
                },
                0,
                false,
            );
            fiber.resume();
            assert_eq!(mxcsr(), outer);
            fiber.resume();
            assert_eq!(seen.load(Ordering::SeqCst) & 0x6000, 0x6000);
            assert_eq!(mxcsr(), outer);
        })
        .join()
        .unwrap();
    }
}
