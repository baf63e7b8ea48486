//! Architecture-specific context capture and hand-off
//!
//! Each architecture provides the same surface:
//!
//! - `MachineContext` - full register file of a suspended fiber
//! - `capture_context(ctx)` - snapshot of the caller's registers
//! - `switch_context(save, load, release)` - save, leave the stack, clear
//!   the outgoing ownership cell, install `load`
//! - `MachineContext::prepare_entry(entry, arg, stack_top)`
//!
//! These are the only pieces of assembly in the workspace.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
    }
}
