//! Stack memory for fibers
//!
//! Platform-specific implementations handle the mapping itself.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
    }
}

use core::fmt;

/// An owned, guarded stack region
///
/// Layout, low to high: `guard` bytes of PROT_NONE, then `size` bytes of
/// read/write stack. The stack grows down from [`top`](Self::top), so an
/// overflow runs into the guard and faults. Unmapped on drop.
pub struct FiberStack {
    /// Start of the whole mapping (guard included)
    map_base: *mut u8,
    /// Length of the whole mapping
    map_len: usize,
    /// Guard length
    guard: usize,
}

// SAFETY: the mapping is plain memory; ownership moves with the value.
unsafe impl Send for FiberStack {}
unsafe impl Sync for FiberStack {}

impl FiberStack {
    /// Lowest usable address
    #[inline]
    pub fn base(&self) -> usize {
        self.map_base as usize + self.guard
    }

    /// Usable size in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.map_len - self.guard
    }

    /// One past the highest usable address (16-byte aligned)
    #[inline]
    pub fn top(&self) -> usize {
        self.map_base as usize + self.map_len
    }

    #[inline]
    pub fn guard_size(&self) -> usize {
        self.guard
    }
}

impl fmt::Debug for FiberStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberStack")
            .field("base", &format_args!("{:#x}", self.base()))
            .field("size", &self.size())
            .field("guard", &self.guard)
            .finish()
    }
}

/// Stack mapping errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackError {
    /// mmap failed
    AllocationFailed,
    /// mprotect of the guard failed
    ProtectionFailed,
    /// Requested size overflows the address space
    TooLarge,
}

impl fmt::Display for StackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackError::AllocationFailed => write!(f, "stack allocation failed"),
            StackError::ProtectionFailed => write!(f, "guard page protection failed"),
            StackError::TooLarge => write!(f, "requested stack is too large"),
        }
    }
}

impl std::error::Error for StackError {}

impl From<StackError> for ufiber_core::FiberError {
    fn from(_: StackError) -> Self {
        ufiber_core::FiberError::AllocationFailure
    }
}
