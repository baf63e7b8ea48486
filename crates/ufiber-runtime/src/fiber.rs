//! Fiber record
//!
//! One `Fiber` per registry row. The ownership cell gates everything
//! mutable in here: the saved context is read or written only by the thread
//! that holds the fiber (or, for a fresh fiber, by its creator before it is
//! published), and FLS only by the owner.

use core::cell::UnsafeCell;
use core::fmt;

use ufiber_core::{
    FiberError, FiberId, FiberLocals, FiberMetrics, FiberResult, FiberState, OwnerCell,
    SpinCell, ThreadId,
};

use crate::current_arch::{self, MachineContext};

/// Entry routine of a created fiber; receives the `arg` given at creation
pub type FiberEntry = unsafe extern "C" fn(usize);

/// Who provides (and frees) a fiber's stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackOwnership {
    /// The stack of the OS thread that was converted
    Thread,
    /// Supplied by the creator; the engine never frees or validates it
    Caller,
}

/// Stack region of a fiber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackDescriptor {
    pub base: usize,
    pub size: usize,
    pub ownership: StackOwnership,
}

impl StackDescriptor {
    /// Descriptor for a converted thread (extent unknown)
    pub const fn thread_stack() -> Self {
        Self {
            base: 0,
            size: 0,
            ownership: StackOwnership::Thread,
        }
    }

    /// One past the highest address
    #[inline]
    pub fn top(&self) -> usize {
        self.base + self.size
    }
}

pub struct Fiber {
    id: FiberId,
    owner: OwnerCell,
    context: UnsafeCell<MachineContext>,
    stack: StackDescriptor,
    locals: SpinCell<FiberLocals>,
    metrics: FiberMetrics,
}

// SAFETY: `context` is only touched by the thread holding `owner` (or by the
// creator before the fiber is published); every other field is Sync.
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Record for a thread that becomes a fiber: running in `tid` as of `now_ns`
    pub fn converted(id: FiberId, tid: ThreadId, now_ns: u64) -> Self {
        Self {
            id,
            owner: OwnerCell::owned_by(tid),
            context: UnsafeCell::new(MachineContext::zeroed()),
            stack: StackDescriptor::thread_stack(),
            locals: SpinCell::new(FiberLocals::new()),
            metrics: FiberMetrics::running_since(tid, now_ns),
        }
    }

    /// Record for a fresh idle fiber that will start at `entry(arg)`
    ///
    /// The context starts as a snapshot of the calling thread, so flags and
    /// FPU control state are inherited from the creator.
    pub fn created(
        id: FiberId,
        creator: ThreadId,
        entry: FiberEntry,
        arg: usize,
        stack_base: usize,
        stack_size: usize,
    ) -> FiberResult<Self> {
        let stack_top = stack_base
            .checked_add(stack_size)
            .ok_or(FiberError::AllocationFailure)?;

        let mut ctx = MachineContext::zeroed();
        // SAFETY: `ctx` is a live, aligned local.
        unsafe { current_arch::capture_context(&mut ctx) };
        ctx.prepare_entry(entry as usize, arg, stack_top);

        Ok(Self {
            id,
            owner: OwnerCell::idle(),
            context: UnsafeCell::new(ctx),
            stack: StackDescriptor {
                base: stack_base,
                size: stack_size,
                ownership: StackOwnership::Caller,
            },
            locals: SpinCell::new(FiberLocals::new()),
            metrics: FiberMetrics::new(creator, entry as usize),
        })
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    #[inline]
    pub fn owner(&self) -> &OwnerCell {
        &self.owner
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        self.owner.load()
    }

    #[inline]
    pub fn stack(&self) -> &StackDescriptor {
        &self.stack
    }

    #[inline]
    pub fn metrics(&self) -> &FiberMetrics {
        &self.metrics
    }

    /// Run `f` on this fiber's FLS
    #[inline]
    pub fn with_locals<R>(&self, f: impl FnOnce(&mut FiberLocals) -> R) -> R {
        self.locals.with(f)
    }

    /// Raw pointer to the saved context, for the hand-off primitive
    #[inline]
    pub(crate) fn context_ptr(&self) -> *mut MachineContext {
        self.context.get()
    }

    /// Copy of the saved context
    ///
    /// # Safety
    ///
    /// The fiber must not be running, or the caller must be its owner.
    pub unsafe fn saved_context(&self) -> MachineContext {
        *self.context.get()
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("stack", &self.stack)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe extern "C" fn never_runs(_arg: usize) {}

    fn tid(v: u32) -> ThreadId {
        ThreadId::new(v).unwrap()
    }

    #[test]
    fn test_converted_is_running() {
        let f = Fiber::converted(FiberId::new(1), tid(5), 100);
        assert_eq!(f.state(), FiberState::Running(tid(5)));
        assert_eq!(f.stack().ownership, StackOwnership::Thread);
        let m = f.metrics().snapshot();
        assert_eq!(m.activations, 1);
        assert_eq!(m.last_activation_ns, Some(100));
        assert_eq!(m.creator, tid(5));
    }

    #[test]
    fn test_created_is_idle_with_prepared_context() {
        let base = 0x7000_0000usize;
        let f = Fiber::created(FiberId::new(2), tid(5), never_runs, 42, base, 0x10000).unwrap();
        assert_eq!(f.state(), FiberState::Idle);
        assert_eq!(f.stack().top(), base + 0x10000);
        assert_eq!(f.stack().ownership, StackOwnership::Caller);

        let ctx = unsafe { f.saved_context() };
        assert_eq!(ctx.instruction_pointer(), never_runs as usize);
        assert_eq!(ctx.first_arg(), 42);
        assert!(ctx.stack_pointer() < base + 0x10000);
        assert!(ctx.stack_pointer() >= base + 0x10000 - 16);

        let m = f.metrics().snapshot();
        assert_eq!(m.activations, 0);
        assert_eq!(m.entry_point, never_runs as usize);
        assert_eq!(m.last_activation_ns, None);
    }

    #[test]
    fn test_created_rejects_wrapping_stack() {
        let r = Fiber::created(FiberId::new(3), tid(1), never_runs, 0, usize::MAX - 4, 64);
        assert_eq!(r.err(), Some(FiberError::AllocationFailure));
    }

    #[test]
    fn test_locals_lazy() {
        let f = Fiber::converted(FiberId::new(1), tid(5), 0);
        assert!(!f.with_locals(|l| l.is_initialized()));
        assert_eq!(f.with_locals(|l| l.alloc()), Ok(0));
        assert_eq!(f.with_locals(|l| l.allocated()), 1);
    }
}
