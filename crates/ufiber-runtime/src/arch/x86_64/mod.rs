//! x86_64 context capture and hand-off
//!
//! The saved context is the full general-purpose register file plus an
//! XSAVE image covering x87, SSE, AVX (upper ymm halves) and AVX-512
//! (opmask k0-k7, upper zmm0-15 halves, zmm16-31). Components the CPU does
//! not enable in XCR0 are simply skipped by the instruction. Requires
//! XSAVE (present on every x86_64 CPU with AVX).
//!
//! Layout (byte offsets, fixed because the assembly below hard-codes them):
//!
//! ```text
//! 0x00 rax  0x08 rbx  0x10 rcx  0x18 rdx  0x20 rsi  0x28 rdi  0x30 rbp  0x38 rsp
//! 0x40 r8 ... 0x78 r15
//! 0x80 rip  0x88 rflags
//! 0xC0 xsave area (2688 bytes, 64-byte aligned, standard format)
//! ```

use std::arch::naked_asm;
use std::sync::atomic::AtomicU32;

/// Components saved on every switch: x87, SSE, AVX, opmask, ZMM_Hi256,
/// Hi16_ZMM. Supervisor, MPX, PKRU and AMX state stay out so the image
/// fits [`XSAVE_AREA_SIZE`].
pub const XSAVE_FEATURES: u64 = 0xE7;

/// End of the Hi16_ZMM component in the standard XSAVE layout
pub const XSAVE_AREA_SIZE: usize = 2688;

/// Standard-format XSAVE/XRSTOR image
///
/// The 64-byte header at offset 512 must start zeroed: XSAVE only ever
/// writes its XSTATE_BV word, and XRSTOR faults on a nonzero XCOMP_BV.
#[derive(Clone, Copy)]
#[repr(C, align(64))]
pub struct XSaveArea(pub [u8; XSAVE_AREA_SIZE]);

impl XSaveArea {
    /// MXCSR from the legacy region
    pub fn mxcsr(&self) -> u32 {
        let b = &self.0;
        u32::from_le_bytes([b[24], b[25], b[26], b[27]])
    }

    /// Components recorded as non-initial by the last XSAVE
    pub fn xstate_bv(&self) -> u64 {
        let mut w = [0u8; 8];
        w.copy_from_slice(&self.0[512..520]);
        u64::from_le_bytes(w)
    }

    pub fn xcomp_bv(&self) -> u64 {
        let mut w = [0u8; 8];
        w.copy_from_slice(&self.0[520..528]);
        u64::from_le_bytes(w)
    }
}

/// Saved machine context of one fiber
#[derive(Clone, Copy)]
#[repr(C, align(64))]
pub struct MachineContext {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
    _pad: [u64; 6],
    pub xsave: XSaveArea,
}

const _: () = {
    use core::mem::offset_of;
    assert!(offset_of!(MachineContext, rdi) == 0x28);
    assert!(offset_of!(MachineContext, rsp) == 0x38);
    assert!(offset_of!(MachineContext, r15) == 0x78);
    assert!(offset_of!(MachineContext, rip) == 0x80);
    assert!(offset_of!(MachineContext, rflags) == 0x88);
    assert!(offset_of!(MachineContext, xsave) == 0xC0);
    assert!(core::mem::size_of::<MachineContext>() == 0xC0 + XSAVE_AREA_SIZE);
};

impl MachineContext {
    /// All-zero context
    ///
    /// Never installed as-is: a converted thread's context is written by its
    /// first outgoing switch, and a created fiber's is captured first.
    pub const fn zeroed() -> Self {
        Self {
            rax: 0,
            rbx: 0,
            rcx: 0,
            rdx: 0,
            rsi: 0,
            rdi: 0,
            rbp: 0,
            rsp: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rip: 0,
            rflags: 0,
            _pad: [0; 6],
            xsave: XSaveArea([0; XSAVE_AREA_SIZE]),
        }
    }

    /// Point a captured context at a fresh entry
    ///
    /// `entry(arg)` runs on the stack ending at `stack_top` with the ABI's
    /// entry alignment (rsp + 8 a multiple of 16). Flags and FPU state are
    /// left as captured.
    pub fn prepare_entry(&mut self, entry: usize, arg: usize, stack_top: usize) {
        self.rip = entry as u64;
        self.rdi = arg as u64;
        self.rsp = ((stack_top & !0xF) - 8) as u64;
        self.rbp = 0;
    }

    #[inline]
    pub fn instruction_pointer(&self) -> usize {
        self.rip as usize
    }

    #[inline]
    pub fn stack_pointer(&self) -> usize {
        self.rsp as usize
    }

    #[inline]
    pub fn first_arg(&self) -> usize {
        self.rdi as usize
    }
}

/// Snapshot the calling thread's registers into `ctx`
///
/// The recorded rip/rsp are those of the caller right after the call
/// returns.
///
/// # Safety
///
/// `ctx` must be valid for writes, 64-byte aligned, and its XSAVE header
/// must be zero or left by a previous save.
#[unsafe(naked)]
pub unsafe extern "C" fn capture_context(_ctx: *mut MachineContext) {
    naked_asm!(
        "mov [rdi + 0x00], rax",
        "mov [rdi + 0x08], rbx",
        "mov [rdi + 0x10], rcx",
        "mov [rdi + 0x18], rdx",
        "mov [rdi + 0x20], rsi",
        "mov [rdi + 0x28], rdi",
        "mov [rdi + 0x30], rbp",
        "lea rax, [rsp + 8]",
        "mov [rdi + 0x38], rax",
        "mov [rdi + 0x40], r8",
        "mov [rdi + 0x48], r9",
        "mov [rdi + 0x50], r10",
        "mov [rdi + 0x58], r11",
        "mov [rdi + 0x60], r12",
        "mov [rdi + 0x68], r13",
        "mov [rdi + 0x70], r14",
        "mov [rdi + 0x78], r15",
        "mov rax, [rsp]",
        "mov [rdi + 0x80], rax",
        "pushfq",
        "pop rax",
        "mov [rdi + 0x88], rax",
        "mov eax, {features}",
        "xor edx, edx",
        "xsave64 [rdi + 0xC0]",
        "ret",
        features = const XSAVE_FEATURES,
    );
}

/// Save the running context into `save`, then run `load`
///
/// The saved context resumes as a plain return from this call. The
/// ownership cell behind `release` is cleared (release store) only after
/// rsp has moved onto the target stack, so the thread that claims the
/// outgoing fiber next can never observe its stack in use.
///
/// # Safety
///
/// - `save` must be valid for writes, `load` a context produced by
///   [`capture_context`] (+ [`MachineContext::prepare_entry`]) or by a
///   previous switch, both 64-byte aligned.
/// - The caller must own the fiber behind `load` and the one behind
///   `release`.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(
    _save: *mut MachineContext,
    _load: *const MachineContext,
    _release: *const AtomicU32,
) {
    naked_asm!(
        // Save outgoing registers to save (RDI)
        "mov [rdi + 0x00], rax",
        "mov [rdi + 0x08], rbx",
        "mov [rdi + 0x10], rcx",
        "mov [rdi + 0x18], rdx",
        "mov [rdi + 0x20], rsi",
        "mov [rdi + 0x28], rdi",
        "mov [rdi + 0x30], rbp",
        "lea rax, [rsp + 8]",
        "mov [rdi + 0x38], rax",
        "mov [rdi + 0x40], r8",
        "mov [rdi + 0x48], r9",
        "mov [rdi + 0x50], r10",
        "mov [rdi + 0x58], r11",
        "mov [rdi + 0x60], r12",
        "mov [rdi + 0x68], r13",
        "mov [rdi + 0x70], r14",
        "mov [rdi + 0x78], r15",
        "mov rax, [rsp]",
        "mov [rdi + 0x80], rax",
        "pushfq",
        "pop rax",
        "mov [rdi + 0x88], rax",
        // XSAVE takes its component mask in EDX:EAX; release moves to R8
        "mov r8, rdx",
        "mov eax, {features}",
        "xor edx, edx",
        "xsave64 [rdi + 0xC0]",
        // Leave the outgoing stack, then give the outgoing fiber up
        "mov rsp, [rsi + 0x38]",
        "mov dword ptr [r8], 0",
        // Load incoming registers from load (RSI)
        "mov eax, {features}",
        "xor edx, edx",
        "xrstor64 [rsi + 0xC0]",
        "mov rax, [rsi + 0x00]",
        "mov rbx, [rsi + 0x08]",
        "mov rcx, [rsi + 0x10]",
        "mov rdx, [rsi + 0x18]",
        "mov rdi, [rsi + 0x28]",
        "mov rbp, [rsi + 0x30]",
        "mov r8,  [rsi + 0x40]",
        "mov r9,  [rsi + 0x48]",
        "mov r10, [rsi + 0x50]",
        "mov r11, [rsi + 0x58]",
        "mov r12, [rsi + 0x60]",
        "mov r13, [rsi + 0x68]",
        "mov r14, [rsi + 0x70]",
        "mov r15, [rsi + 0x78]",
        // Push RIP and RFLAGS for return
        "push qword ptr [rsi + 0x80]",
        "push qword ptr [rsi + 0x88]",
        // Now restore RSI
        "mov rsi, [rsi + 0x20]",
        "popfq",
        "ret",
        features = const XSAVE_FEATURES,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::arch::asm;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Round toward zero, all exceptions masked
    const MXCSR_RZ: u32 = 0x7F80;

    fn read_mxcsr() -> u32 {
        let mut v: u32 = 0;
        unsafe { asm!("stmxcsr [{}]", in(reg) &mut v, options(nostack)) };
        v
    }

    fn write_mxcsr(v: u32) {
        unsafe { asm!("ldmxcsr [{}]", in(reg) &v, options(nostack)) };
    }

    /// Main context plus one fiber that runs `work` once per visit
    struct Rig {
        main: MachineContext,
        fiber: MachineContext,
        main_owner: AtomicU32,
        fiber_owner: AtomicU32,
        work: unsafe fn(&mut Vec<u32>),
        seen: Vec<u32>,
        stack: Vec<u128>,
    }

    impl Rig {
        fn new(work: unsafe fn(&mut Vec<u32>)) -> Box<Self> {
            let mut rig = Box::new(Rig {
                main: MachineContext::zeroed(),
                fiber: MachineContext::zeroed(),
                main_owner: AtomicU32::new(0),
                fiber_owner: AtomicU32::new(0),
                work,
                seen: Vec::new(),
                stack: vec![0u128; 4096],
            });
            let top = rig.stack.as_ptr() as usize + rig.stack.len() * 16;
            let arg = &mut *rig as *mut Rig as usize;
            unsafe { capture_context(&mut rig.fiber) };
            rig.fiber.prepare_entry(rig_fiber as usize, arg, top);
            rig
        }
    }

    extern "C" fn rig_fiber(arg: usize) {
        let rig = arg as *mut Rig;
        unsafe {
            loop {
                ((*rig).work)(&mut (*rig).seen);
                (*rig).fiber_owner.store(1, Ordering::Relaxed);
                switch_context(&mut (*rig).fiber, &(*rig).main, &(*rig).fiber_owner);
            }
        }
    }

    unsafe fn set_round_to_zero(seen: &mut Vec<u32>) {
        write_mxcsr(MXCSR_RZ);
        seen.push(read_mxcsr());
    }

    #[target_feature(enable = "avx")]
    unsafe fn fill_ymm8(seen: &mut Vec<u32>) {
        asm!("vpcmpeqd ymm8, ymm8, ymm8", options(nostack), clobber_abi("C"));
        seen.push(1);
    }

    #[target_feature(enable = "avx512f")]
    unsafe fn fill_zmm8_zmm24(seen: &mut Vec<u32>) {
        asm!(
            "vpternlogd zmm8, zmm8, zmm8, 0xFF",
            "vpternlogd zmm24, zmm24, zmm24, 0xFF",
            "kxnorw k3, k3, k3",
            options(nostack),
            clobber_abi("C"),
        );
        seen.push(1);
    }

    /// Load ymm8 from `value`, run the fiber once, return ymm8 afterwards
    #[target_feature(enable = "avx")]
    unsafe fn visit_holding_ymm8(rig: *mut Rig, value: &[u8; 32]) -> [u8; 32] {
        let mut out = [0u8; 32];
        (*rig).main_owner.store(1, Ordering::Relaxed);
        asm!(
            "vmovdqu ymm8, [r12]",
            "call rax",
            "vmovdqu [r13], ymm8",
            "vzeroupper",
            in("rax") switch_context as usize,
            in("rdi") &raw mut (*rig).main,
            in("rsi") &raw const (*rig).fiber,
            in("rdx") &raw const (*rig).main_owner,
            in("r12") value.as_ptr(),
            in("r13") out.as_mut_ptr(),
            clobber_abi("C"),
        );
        out
    }

    /// Same for zmm8 (low bank), zmm24 (high bank) and opmask k3
    #[target_feature(enable = "avx512f")]
    unsafe fn visit_holding_zmm(rig: *mut Rig, value: &[u8; 64]) -> ([u8; 128], u16) {
        let mut out = [0u8; 128];
        let mask: u64;
        (*rig).main_owner.store(1, Ordering::Relaxed);
        asm!(
            "vmovdqu64 zmm8, [r12]",
            "vmovdqu64 zmm24, [r12]",
            "mov ecx, 0x5A5A",
            "kmovw k3, ecx",
            "call rax",
            "vmovdqu64 [r13], zmm8",
            "vmovdqu64 [r13 + 64], zmm24",
            "kmovw eax, k3",
            "vzeroupper",
            inout("rax") switch_context as usize => mask,
            in("rdi") &raw mut (*rig).main,
            in("rsi") &raw const (*rig).fiber,
            in("rdx") &raw const (*rig).main_owner,
            in("r12") value.as_ptr(),
            in("r13") out.as_mut_ptr(),
            clobber_abi("C"),
        );
        (out, mask as u16)
    }

    fn pattern<const N: usize>() -> [u8; N] {
        let mut v = [0u8; N];
        for (i, b) in v.iter_mut().enumerate() {
            *b = i as u8 + 1;
        }
        v
    }

    #[test]
    fn test_layout() {
        assert_eq!(core::mem::align_of::<MachineContext>(), 64);
        assert_eq!(core::mem::size_of::<MachineContext>(), 0xC0 + XSAVE_AREA_SIZE);
    }

    #[test]
    #[allow(unused_unsafe)]
    fn test_area_holds_enabled_components() {
        use core::arch::x86_64::__cpuid_count;
        for component in [2u32, 5, 6, 7] {
            if XSAVE_FEATURES & (1 << component) == 0 {
                continue;
            }
            let leaf = unsafe { __cpuid_count(0xD, component) };
            // eax = size, ebx = standard-format offset; zero when unsupported
            if leaf.eax != 0 {
                assert!(
                    (leaf.ebx + leaf.eax) as usize <= XSAVE_AREA_SIZE,
                    "component {} at {}+{}",
                    component,
                    leaf.ebx,
                    leaf.eax
                );
            }
        }
    }

    #[test]
    fn test_capture_records_caller_frame() {
        let mut ctx = Box::new(MachineContext::zeroed());
        unsafe { capture_context(&mut *ctx) };
        assert_ne!(ctx.rip, 0);
        assert_ne!(ctx.rsp, 0);
        assert_eq!(ctx.xsave.mxcsr(), read_mxcsr());
        assert_eq!(ctx.xsave.xcomp_bv(), 0);
        assert_eq!(ctx.xsave.xstate_bv() & !XSAVE_FEATURES, 0);
    }

    #[test]
    fn test_prepare_entry_alignment() {
        let mut ctx = MachineContext::zeroed();
        ctx.prepare_entry(0x1234, 99, 0x10_0007);
        assert_eq!(ctx.instruction_pointer(), 0x1234);
        assert_eq!(ctx.first_arg(), 99);
        assert_eq!((ctx.stack_pointer() + 8) % 16, 0);
        assert!(ctx.stack_pointer() < 0x10_0007);
    }

    #[test]
    fn test_mxcsr_follows_context() {
        let original = read_mxcsr();
        let mut rig = Rig::new(set_round_to_zero);
        let r = &mut *rig as *mut Rig;

        unsafe {
            for round in 1..=3 {
                (*r).main_owner.store(1, Ordering::Relaxed);
                switch_context(&mut (*r).main, &(*r).fiber, &(*r).main_owner);
                assert_eq!((*r).main_owner.load(Ordering::Relaxed), 0);
                assert_eq!((*r).fiber_owner.load(Ordering::Relaxed), 0);
                assert_eq!((*r).seen.len(), round);
                assert_eq!(read_mxcsr(), original);
            }
            assert_eq!((*r).fiber.xsave.mxcsr(), MXCSR_RZ);
        }

        assert!(rig.seen.iter().all(|&v| v == MXCSR_RZ));
    }

    #[test]
    fn test_ymm_survives_switch() {
        if !is_x86_feature_detected!("avx") {
            return;
        }
        let value = pattern::<32>();
        let mut rig = Rig::new(fill_ymm8);
        let r = &mut *rig as *mut Rig;

        for round in 1..=2 {
            let back = unsafe { visit_holding_ymm8(r, &value) };
            assert_eq!(rig.seen.len(), round);
            assert_eq!(back, value, "ymm8 after round {}", round);
        }
    }

    #[test]
    fn test_zmm_and_opmask_survive_switch() {
        if !is_x86_feature_detected!("avx512f") {
            return;
        }
        let value = pattern::<64>();
        let mut rig = Rig::new(fill_zmm8_zmm24);
        let r = &mut *rig as *mut Rig;

        let (back, k3) = unsafe { visit_holding_zmm(r, &value) };
        assert_eq!(rig.seen.len(), 1);
        assert_eq!(&back[..64], &value[..], "zmm8");
        assert_eq!(&back[64..], &value[..], "zmm24");
        assert_eq!(k3, 0x5A5A);
    }
}
