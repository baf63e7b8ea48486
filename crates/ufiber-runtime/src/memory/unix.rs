//! Unix stack mapping using mmap

use super::{FiberStack, StackError};
use crate::CurrentPlatform;

impl FiberStack {
    /// Map a stack of at least `size` usable bytes with `guard_pages`
    /// inaccessible pages below it
    ///
    /// Both parts are rounded up to whole pages. Pages are committed lazily
    /// by the kernel on first touch.
    pub fn allocate(size: usize, guard_pages: usize) -> Result<Self, StackError> {
        let page = CurrentPlatform::new().page_size();
        let size = size
            .checked_next_multiple_of(page)
            .ok_or(StackError::TooLarge)?
            .max(page);
        let guard = guard_pages.checked_mul(page).ok_or(StackError::TooLarge)?;
        let map_len = size.checked_add(guard).ok_or(StackError::TooLarge)?;

        // SAFETY: anonymous private mapping, no existing memory involved.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(StackError::AllocationFailed);
        }

        let stack = FiberStack {
            map_base: base as *mut u8,
            map_len,
            guard,
        };

        if guard > 0 {
            // Guard at the low end: the stack grows down into it
            // SAFETY: [base, base + guard) is inside the mapping above.
            let ret = unsafe { libc::mprotect(base, guard, libc::PROT_NONE) };
            if ret != 0 {
                // `stack` unmaps on drop
                return Err(StackError::ProtectionFailed);
            }
        }

        Ok(stack)
    }
}

impl Drop for FiberStack {
    fn drop(&mut self) {
        // SAFETY: we own the whole mapping.
        unsafe {
            libc::munmap(self.map_base as *mut libc::c_void, self.map_len);
        }
    }
}
