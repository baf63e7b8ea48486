//! aarch64 context capture and hand-off
//!
//! Layout (byte offsets):
//!
//! ```text
//! 0x000 x0 ... 0x0F0 x30 (lr)
//! 0x0F8 sp   0x100 pc   0x108 nzcv   0x110 fpcr   0x118 fpsr
//! 0x120 q0 ... 0x310 q31
//! ```
//!
//! The hand-off branches through x16 (IP0), so x16 is not preserved across
//! a resume. The ABI already treats it as clobbered by any call.

use std::arch::naked_asm;
use std::sync::atomic::AtomicU32;

/// Saved machine context of one fiber
#[derive(Clone, Copy)]
#[repr(C, align(16))]
pub struct MachineContext {
    pub x: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub nzcv: u64,
    pub fpcr: u64,
    pub fpsr: u64,
    pub q: [u128; 32],
}

const _: () = {
    use core::mem::offset_of;
    assert!(offset_of!(MachineContext, sp) == 0xF8);
    assert!(offset_of!(MachineContext, pc) == 0x100);
    assert!(offset_of!(MachineContext, nzcv) == 0x108);
    assert!(offset_of!(MachineContext, fpsr) == 0x118);
    assert!(offset_of!(MachineContext, q) == 0x120);
};

impl MachineContext {
    pub const fn zeroed() -> Self {
        Self {
            x: [0; 31],
            sp: 0,
            pc: 0,
            nzcv: 0,
            fpcr: 0,
            fpsr: 0,
            q: [0; 32],
        }
    }

    /// Point a captured context at a fresh entry
    ///
    /// sp must stay 16-byte aligned on this architecture, so the word
    /// reserved below the top is rounded down.
    pub fn prepare_entry(&mut self, entry: usize, arg: usize, stack_top: usize) {
        self.pc = entry as u64;
        self.x[0] = arg as u64;
        self.x[29] = 0;
        self.x[30] = 0;
        self.sp = ((stack_top - 8) & !0xF) as u64;
    }

    #[inline]
    pub fn instruction_pointer(&self) -> usize {
        self.pc as usize
    }

    #[inline]
    pub fn stack_pointer(&self) -> usize {
        self.sp as usize
    }

    #[inline]
    pub fn first_arg(&self) -> usize {
        self.x[0] as usize
    }
}

/// Snapshot the calling thread's registers into `ctx`
///
/// # Safety
///
/// `ctx` must be valid for writes and 16-byte aligned.
#[unsafe(naked)]
pub unsafe extern "C" fn capture_context(_ctx: *mut MachineContext) {
    naked_asm!(
        "stp x0, x1, [x0, #0x00]",
        "stp x2, x3, [x0, #0x10]",
        "stp x4, x5, [x0, #0x20]",
        "stp x6, x7, [x0, #0x30]",
        "stp x8, x9, [x0, #0x40]",
        "stp x10, x11, [x0, #0x50]",
        "stp x12, x13, [x0, #0x60]",
        "stp x14, x15, [x0, #0x70]",
        "stp x16, x17, [x0, #0x80]",
        "stp x18, x19, [x0, #0x90]",
        "stp x20, x21, [x0, #0xA0]",
        "stp x22, x23, [x0, #0xB0]",
        "stp x24, x25, [x0, #0xC0]",
        "stp x26, x27, [x0, #0xD0]",
        "stp x28, x29, [x0, #0xE0]",
        "str x30, [x0, #0xF0]",
        "mov x9, sp",
        "str x9, [x0, #0xF8]",
        "str x30, [x0, #0x100]",
        "mrs x9, nzcv",
        "str x9, [x0, #0x108]",
        "mrs x9, fpcr",
        "str x9, [x0, #0x110]",
        "mrs x9, fpsr",
        "str x9, [x0, #0x118]",
        "stp q0, q1, [x0, #0x120]",
        "stp q2, q3, [x0, #0x140]",
        "stp q4, q5, [x0, #0x160]",
        "stp q6, q7, [x0, #0x180]",
        "stp q8, q9, [x0, #0x1A0]",
        "stp q10, q11, [x0, #0x1C0]",
        "stp q12, q13, [x0, #0x1E0]",
        "stp q14, q15, [x0, #0x200]",
        "stp q16, q17, [x0, #0x220]",
        "stp q18, q19, [x0, #0x240]",
        "stp q20, q21, [x0, #0x260]",
        "stp q22, q23, [x0, #0x280]",
        "stp q24, q25, [x0, #0x2A0]",
        "stp q26, q27, [x0, #0x2C0]",
        "stp q28, q29, [x0, #0x2E0]",
        "stp q30, q31, [x0, #0x300]",
        "ret",
    );
}

/// Save the running context into `save`, then run `load`
///
/// Same contract as the x86_64 version: the outgoing fiber's ownership
/// cell is cleared with a store-release only once sp points into the
/// incoming stack.
///
/// # Safety
///
/// See the x86_64 `switch_context`.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(
    _save: *mut MachineContext,
    _load: *const MachineContext,
    _release: *const AtomicU32,
) {
    naked_asm!(
        // Save outgoing registers to save (x0)
        "stp x0, x1, [x0, #0x00]",
        "stp x2, x3, [x0, #0x10]",
        "stp x4, x5, [x0, #0x20]",
        "stp x6, x7, [x0, #0x30]",
        "stp x8, x9, [x0, #0x40]",
        "stp x10, x11, [x0, #0x50]",
        "stp x12, x13, [x0, #0x60]",
        "stp x14, x15, [x0, #0x70]",
        "stp x16, x17, [x0, #0x80]",
        "stp x18, x19, [x0, #0x90]",
        "stp x20, x21, [x0, #0xA0]",
        "stp x22, x23, [x0, #0xB0]",
        "stp x24, x25, [x0, #0xC0]",
        "stp x26, x27, [x0, #0xD0]",
        "stp x28, x29, [x0, #0xE0]",
        "str x30, [x0, #0xF0]",
        "mov x9, sp",
        "str x9, [x0, #0xF8]",
        "str x30, [x0, #0x100]",
        "mrs x9, nzcv",
        "str x9, [x0, #0x108]",
        "mrs x9, fpcr",
        "str x9, [x0, #0x110]",
        "mrs x9, fpsr",
        "str x9, [x0, #0x118]",
        "stp q0, q1, [x0, #0x120]",
        "stp q2, q3, [x0, #0x140]",
        "stp q4, q5, [x0, #0x160]",
        "stp q6, q7, [x0, #0x180]",
        "stp q8, q9, [x0, #0x1A0]",
        "stp q10, q11, [x0, #0x1C0]",
        "stp q12, q13, [x0, #0x1E0]",
        "stp q14, q15, [x0, #0x200]",
        "stp q16, q17, [x0, #0x220]",
        "stp q18, q19, [x0, #0x240]",
        "stp q20, q21, [x0, #0x260]",
        "stp q22, q23, [x0, #0x280]",
        "stp q24, q25, [x0, #0x2A0]",
        "stp q26, q27, [x0, #0x2C0]",
        "stp q28, q29, [x0, #0x2E0]",
        "stp q30, q31, [x0, #0x300]",
        // Leave the outgoing stack, then give the outgoing fiber up
        "ldr x9, [x1, #0xF8]",
        "mov sp, x9",
        "stlr wzr, [x2]",
        // Load incoming registers from load (x1)
        "ldr x9, [x1, #0x108]",
        "msr nzcv, x9",
        "ldr x9, [x1, #0x110]",
        "msr fpcr, x9",
        "ldr x9, [x1, #0x118]",
        "msr fpsr, x9",
        "ldp q0, q1, [x1, #0x120]",
        "ldp q2, q3, [x1, #0x140]",
        "ldp q4, q5, [x1, #0x160]",
        "ldp q6, q7, [x1, #0x180]",
        "ldp q8, q9, [x1, #0x1A0]",
        "ldp q10, q11, [x1, #0x1C0]",
        "ldp q12, q13, [x1, #0x1E0]",
        "ldp q14, q15, [x1, #0x200]",
        "ldp q16, q17, [x1, #0x220]",
        "ldp q18, q19, [x1, #0x240]",
        "ldp q20, q21, [x1, #0x260]",
        "ldp q22, q23, [x1, #0x280]",
        "ldp q24, q25, [x1, #0x2A0]",
        "ldp q26, q27, [x1, #0x2C0]",
        "ldp q28, q29, [x1, #0x2E0]",
        "ldp q30, q31, [x1, #0x300]",
        "ldr x16, [x1, #0x100]",
        "ldp x2, x3, [x1, #0x10]",
        "ldp x4, x5, [x1, #0x20]",
        "ldp x6, x7, [x1, #0x30]",
        "ldp x8, x9, [x1, #0x40]",
        "ldp x10, x11, [x1, #0x50]",
        "ldp x12, x13, [x1, #0x60]",
        "ldp x14, x15, [x1, #0x70]",
        "ldr x17, [x1, #0x88]",
        "ldp x18, x19, [x1, #0x90]",
        "ldp x20, x21, [x1, #0xA0]",
        "ldp x22, x23, [x1, #0xB0]",
        "ldp x24, x25, [x1, #0xC0]",
        "ldp x26, x27, [x1, #0xD0]",
        "ldp x28, x29, [x1, #0xE0]",
        "ldr x30, [x1, #0xF0]",
        "ldr x0, [x1, #0x00]",
        "ldr x1, [x1, #0x08]",
        "br x16",
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        assert_eq!(core::mem::align_of::<MachineContext>(), 16);
        assert_eq!(core::mem::size_of::<MachineContext>(), 0x120 + 32 * 16);
    }

    #[test]
    fn test_prepare_entry_alignment() {
        let mut ctx = MachineContext::zeroed();
        ctx.prepare_entry(0x4000, 7, 0x10_0008);
        assert_eq!(ctx.instruction_pointer(), 0x4000);
        assert_eq!(ctx.first_arg(), 7);
        assert_eq!(ctx.stack_pointer() % 16, 0);
        assert!(ctx.stack_pointer() <= 0x10_0000);
    }
}
