//! Identifier types for processes, threads and fibers
//!
//! All three are thin wrappers over the 32-bit ids the OS (or the fiber-id
//! counter) hands out. A `ThreadId` can never be zero: zero is the "idle"
//! encoding inside a fiber's ownership cell.

use core::fmt;
use core::num::NonZeroU32;

/// OS process id (tgid on Linux)
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ProcessId(u32);

impl ProcessId {
    #[inline]
    pub const fn new(pid: u32) -> Self {
        ProcessId(pid)
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl From<u32> for ProcessId {
    #[inline]
    fn from(pid: u32) -> Self {
        ProcessId(pid)
    }
}

impl fmt::Debug for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProcessId({})", self.0)
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// OS thread id, unique within its process
///
/// Backed by `NonZeroU32` so that `Option<ThreadId>` packs into a `u32`
/// with `None` as zero, which is exactly the idle encoding of
/// [`OwnerCell`](crate::state::OwnerCell).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ThreadId(NonZeroU32);

impl ThreadId {
    /// Create from a raw id; returns `None` for zero
    #[inline]
    pub const fn new(tid: u32) -> Option<Self> {
        match NonZeroU32::new(tid) {
            Some(v) => Some(ThreadId(v)),
            None => None,
        }
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Debug for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ThreadId({})", self.0)
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fiber identifier, unique within its process for the process's lifetime
///
/// Ids are handed out by [`FiberIdCounter`]; the first one is 1 and values
/// are never reused.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FiberId(u32);

impl FiberId {
    /// Create a new FiberId from a raw value
    #[inline]
    pub const fn new(id: u32) -> Self {
        FiberId(id)
    }

    /// Get the raw u32 value
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl From<u32> for FiberId {
    #[inline]
    fn from(id: u32) -> Self {
        FiberId(id)
    }
}

impl From<FiberId> for u32 {
    #[inline]
    fn from(id: FiberId) -> Self {
        id.0
    }
}

impl fmt::Debug for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FiberId({})", self.0)
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-process monotonically increasing fiber-id source
pub struct FiberIdCounter {
    last: core::sync::atomic::AtomicU32,
}

impl FiberIdCounter {
    pub const fn new() -> Self {
        Self {
            last: core::sync::atomic::AtomicU32::new(0),
        }
    }

    /// Hand out the next id, or `None` once the 32-bit space is exhausted
    pub fn next(&self) -> Option<FiberId> {
        use core::sync::atomic::Ordering;

        self.last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_add(1))
            .ok()
            .map(|prev| FiberId(prev + 1))
    }

    /// Last id handed out (0 if none yet)
    pub fn last(&self) -> u32 {
        self.last.load(core::sync::atomic::Ordering::Acquire)
    }
}

impl Default for FiberIdCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_id_rejects_zero() {
        assert!(ThreadId::new(0).is_none());
        assert_eq!(ThreadId::new(7).map(ThreadId::as_u32), Some(7));
        assert_eq!(
            core::mem::size_of::<Option<ThreadId>>(),
            core::mem::size_of::<u32>()
        );
    }

    #[test]
    fn test_counter_starts_at_one_and_increments() {
        let c = FiberIdCounter::new();
        assert_eq!(c.next(), Some(FiberId::new(1)));
        assert_eq!(c.next(), Some(FiberId::new(2)));
        assert_eq!(c.last(), 2);
    }

    #[test]
    fn test_counter_exhaustion() {
        let c = FiberIdCounter {
            last: core::sync::atomic::AtomicU32::new(u32::MAX - 1),
        };
        assert_eq!(c.next(), Some(FiberId::new(u32::MAX)));
        assert_eq!(c.next(), None);
        assert_eq!(c.last(), u32::MAX);
    }

    #[test]
    fn test_counter_concurrent_ids_distinct() {
        use std::collections::HashSet;
        use std::sync::Arc;

        let c = Arc::new(FiberIdCounter::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let c = Arc::clone(&c);
                std::thread::spawn(move || (0..1000).filter_map(|_| c.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {}", id);
            }
        }
        assert_eq!(seen.len(), 4000);
    }
}
