//! Fiber ownership state
//!
//! A fiber is either idle or running inside exactly one thread. The state
//! lives in a single `AtomicU32`: 0 means idle, anything else is the id of
//! the owning thread. It moves Idle -> Running only through
//! [`OwnerCell::try_claim`] and Running -> Idle only through a release
//! store by the owner.

use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::id::ThreadId;

/// Raw encoding of the idle state
pub const IDLE: u32 = 0;

/// Observable state of a fiber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    /// Not executing anywhere; may be claimed by a switch
    Idle,

    /// Executing inside the given thread
    Running(ThreadId),
}

impl FiberState {
    #[inline]
    pub const fn is_running(&self) -> bool {
        matches!(self, FiberState::Running(_))
    }

    /// Owning thread, if any
    #[inline]
    pub const fn owner(&self) -> Option<ThreadId> {
        match self {
            FiberState::Idle => None,
            FiberState::Running(tid) => Some(*tid),
        }
    }
}

impl From<u32> for FiberState {
    fn from(v: u32) -> Self {
        match ThreadId::new(v) {
            Some(tid) => FiberState::Running(tid),
            None => FiberState::Idle,
        }
    }
}

impl From<FiberState> for u32 {
    fn from(state: FiberState) -> u32 {
        match state {
            FiberState::Idle => IDLE,
            FiberState::Running(tid) => tid.as_u32(),
        }
    }
}

impl fmt::Display for FiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FiberState::Idle => write!(f, "idle"),
            FiberState::Running(tid) => write!(f, "running in {}", tid),
        }
    }
}

/// Atomic ownership cell of one fiber
#[repr(transparent)]
pub struct OwnerCell(AtomicU32);

impl OwnerCell {
    /// Cell in the idle state
    pub const fn idle() -> Self {
        OwnerCell(AtomicU32::new(IDLE))
    }

    /// Cell already owned by `tid` (used for converted threads)
    pub const fn owned_by(tid: ThreadId) -> Self {
        OwnerCell(AtomicU32::new(tid.as_u32()))
    }

    #[inline]
    pub fn load(&self) -> FiberState {
        FiberState::from(self.0.load(Ordering::Acquire))
    }

    /// Claim an idle fiber for `tid`
    ///
    /// Single compare-and-swap Idle -> Running(tid). On failure the cell is
    /// untouched and the state that was observed is returned.
    #[inline]
    pub fn try_claim(&self, tid: ThreadId) -> Result<(), FiberState> {
        self.0
            .compare_exchange(IDLE, tid.as_u32(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(FiberState::from)
    }

    /// Give the fiber up
    ///
    /// Only the owner may call this, and only once it no longer touches the
    /// fiber's stack or saved context.
    #[inline]
    pub fn release(&self) {
        self.0.store(IDLE, Ordering::Release);
    }

    /// Raw cell address for the context-switch primitive, which performs
    /// the release store itself after leaving the outgoing stack.
    #[inline]
    pub fn as_ptr(&self) -> *const AtomicU32 {
        &self.0
    }
}

impl fmt::Debug for OwnerCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OwnerCell({})", self.load())
    }
}
