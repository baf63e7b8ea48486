//! Thread-local record of the fiber running on this OS thread
//!
//! Written by the engine right before each hand-off, read by the log tag
//! and by `current_fiber()` style helpers. It is a convenience view only:
//! the registry's `Thread.activeFiber` is authoritative.

use std::cell::Cell;
use std::fmt::Write;
use ufiber_core::FiberId;

use crate::CurrentPlatform;

thread_local! {
    /// Raw id of the fiber executing on this thread (0 = none)
    static CURRENT_FIBER: Cell<u32> = const { Cell::new(0) };
}

#[inline]
pub fn set_current_fiber(id: Option<FiberId>) {
    CURRENT_FIBER.with(|cell| cell.set(id.map_or(0, FiberId::as_u32)));
}

#[inline]
pub fn current_fiber() -> Option<FiberId> {
    match CURRENT_FIBER.with(|cell| cell.get()) {
        0 => None,
        raw => Some(FiberId::new(raw)),
    }
}

/// Log tag: `t<tid>` or `t<tid>/f<fid>`
pub fn context_tag(buf: &mut String) {
    let tid = CurrentPlatform::new().current_thread();
    let _ = write!(buf, "t{}", tid);
    if let Some(fid) = current_fiber() {
        let _ = write!(buf, "/f{}", fid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_fiber_roundtrip() {
        std::thread::spawn(|| {
            assert_eq!(current_fiber(), None);
            set_current_fiber(Some(FiberId::new(9)));
            assert_eq!(current_fiber(), Some(FiberId::new(9)));

            let mut tag = String::new();
            context_tag(&mut tag);
            assert!(tag.starts_with('t'));
            assert!(tag.ends_with("/f9"));

            set_current_fiber(None);
            assert_eq!(current_fiber(), None);
        })
        .join()
        .unwrap();
    }
}
