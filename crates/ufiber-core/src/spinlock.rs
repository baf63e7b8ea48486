//! Spin-guarded cell for per-fiber data
//!
//! Guards state that, by protocol, only the thread owning a fiber touches
//! (its FLS table). In correct use the lock is therefore never contended
//! and costs a single compare-and-swap; it exists so that a caller lying
//! about its thread id gets serialized instead of racing.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

pub struct SpinCell<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: all access to `data` happens while `locked` is held.
unsafe impl<T: Send> Send for SpinCell<T> {}
unsafe impl<T: Send> Sync for SpinCell<T> {}

impl<T> SpinCell<T> {
    #[inline]
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    #[inline]
    fn acquire(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    /// Run `f` with exclusive access, spinning while another thread holds it
    #[inline]
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        self.acquire();
        let _release = Release(&self.locked);
        // SAFETY: `locked` is held until `_release` drops.
        f(unsafe { &mut *self.data.get() })
    }
}

/// Clears the flag on scope exit, including on unwind out of `f`
struct Release<'a>(&'a AtomicBool);

impl Drop for Release<'_> {
    #[inline]
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
