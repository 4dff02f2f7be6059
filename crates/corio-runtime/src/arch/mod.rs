//! Architecture-specific context switching
//!
//! Each backend provides exactly three things:
//!
//! - `SavedRegs`: callee-saved register block of a suspended context
//! - `init_context`: prepare a fresh context that enters `entry(arg)` on a new stack
//! - `context_switch`: save the running context into `old`, resume `new`
//!
//! Nothing outside this module touches registers or stack pointers.

/// Entry point a fresh context starts in. Must never return.
pub type EntryFn = extern "C" fn(usize) -> !;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub use self::x86_64::{context_switch, init_context, SavedRegs};
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use self::aarch64::{context_switch, init_context, SavedRegs};
    } else {
        compile_error!("corio supports x86_64 and aarch64 only");
    }
}
