//! aarch64 (AAPCS64) context switching

use super::EntryFn;
use std::arch::naked_asm;

/// Callee-saved state of a suspended context
///
/// Layout: x19..x28 at 0..72, fp at 80, lr at 88, sp at 96, d8..d15 at 104..160.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SavedRegs {
    pub x: [u64; 10],
    pub fp: u64,
    pub lr: u64,
    pub sp: u64,
    pub d: [u64; 8],
}

/// Prepare `regs` so that switching to it runs `entry(arg)` on the given stack.
///
/// # Safety
///
/// `stack_top` must be the upper end of a mapped, writable stack that
/// outlives the context.
#[inline]
pub unsafe fn init_context(regs: &mut SavedRegs, stack_top: *mut u8, entry: EntryFn, arg: usize) {
    let sp = (stack_top as usize) & !0xF;

    *regs = SavedRegs::default();
    regs.sp = sp as u64;
    regs.lr = fiber_trampoline as usize as u64;
    regs.x[0] = entry as usize as u64; // x19
    regs.x[1] = arg as u64; // x20
}

#[unsafe(naked)]
unsafe extern "C" fn fiber_trampoline() {
    naked_asm!(
        "mov x0, x20",
        "blr x19",
        // entry never returns
        "brk #0",
    );
}

/// Save callee-saved registers into `old`, load them from `new`, return into `new`.
///
/// # Safety
///
/// `new` must hold a context produced by `init_context` or a previous
/// `context_switch`, whose stack is still alive.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_old: *mut SavedRegs, _new: *const SavedRegs) {
    naked_asm!(
        // Save into old (x0)
        "stp x19, x20, [x0, #0]",
        "stp x21, x22, [x0, #16]",
        "stp x23, x24, [x0, #32]",
        "stp x25, x26, [x0, #48]",
        "stp x27, x28, [x0, #64]",
        "stp x29, x30, [x0, #80]",
        "mov x9, sp",
        "str x9, [x0, #96]",
        "stp d8, d9, [x0, #104]",
        "stp d10, d11, [x0, #120]",
        "stp d12, d13, [x0, #136]",
        "stp d14, d15, [x0, #152]",
        // Load from new (x1)
        "ldp x19, x20, [x1, #0]",
        "ldp x21, x22, [x1, #16]",
        "ldp x23, x24, [x1, #32]",
        "ldp x25, x26, [x1, #48]",
        "ldp x27, x28, [x1, #64]",
        "ldp x29, x30, [x1, #80]",
        "ldr x9, [x1, #96]",
        "mov sp, x9",
        "ldp d8, d9, [x1, #104]",
        "ldp d10, d11, [x1, #120]",
        "ldp d12, d13, [x1, #136]",
        "ldp d14, d15, [x1, #152]",
        "ret",
    );
}
