//! Fiber engine
//!
//! Every operation takes the caller's `(pid, tid)` explicitly; the façade
//! supplies them from the OS. There is no scheduler thread: a switch runs
//! entirely on the calling thread and completes synchronously.
//!
//! # Switch protocol
//!
//! ```text
//!   resolve process/thread  -> NotConverted
//!   resolve target          -> NoSuchFiber
//!   CAS target.owner 0->tid -> Busy (target.failed += 1, nothing else changes)
//!   resolve source = thread.active
//!   source.running += now - source.last_activation
//!   thread.active = target; target.activations += 1; target.last = now
//!   switch_context(save=source, load=target, release=&source.owner)
//! ```
//!
//! The bookkeeping happens before the hand-off because once the source is
//! released another thread may claim it; the hand-off primitive itself
//! clears the source's owner only after leaving its stack.

use std::convert::Infallible;
use std::sync::Arc;

use ufiber_core::{kdebug, kinfo, ktrace};
use ufiber_core::{FiberError, FiberId, FiberResult, ProcessId, ThreadId};

use crate::clock::now_ns;
use crate::config::FiberConfig;
use crate::current_arch;
use crate::fiber::{Fiber, FiberEntry};
use crate::introspect::FiberInfo;
use crate::registry::{Process, Registry, Thread};
use crate::{tls, CurrentPlatform};

pub struct FiberEngine {
    registry: Registry,
    config: FiberConfig,
}

impl FiberEngine {
    pub fn new(config: FiberConfig) -> Self {
        crate::clock::init();
        ufiber_core::kprint::set_context_tag(tls::context_tag);
        Self {
            registry: Registry::new(),
            config,
        }
    }

    #[inline]
    pub fn config(&self) -> &FiberConfig {
        &self.config
    }

    #[inline]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn resolve(&self, pid: ProcessId, tid: ThreadId) -> FiberResult<(Arc<Process>, Arc<Thread>)> {
        let process = self.registry.process(pid).ok_or(FiberError::NotConverted)?;
        let thread = process.thread(tid).ok_or(FiberError::NotConverted)?;
        Ok((process, thread))
    }

    fn active_fiber_record(&self, pid: ProcessId, tid: ThreadId) -> FiberResult<Arc<Fiber>> {
        let (process, thread) = self.resolve(pid, tid)?;
        let fiber = process
            .fiber(thread.active_fiber())
            .ok_or(FiberError::NoSuchFiber)?;
        debug_assert_eq!(fiber.state().owner(), Some(tid));
        Ok(fiber)
    }

    /// Turn the calling thread into a fiber
    ///
    /// The new fiber runs on the thread's own stack and is owned by `tid`
    /// from the start. Converting twice fails with `AlreadyConverted`
    /// without consuming a fiber id.
    pub fn convert_thread_to_fiber(&self, pid: ProcessId, tid: ThreadId) -> FiberResult<FiberId> {
        let process = self.registry.get_or_create(pid);
        let now = now_ns();
        let id = process.register_thread(tid, |id| Fiber::converted(id, tid, now))?;

        tls::set_current_fiber(Some(id));
        kdebug!("pid {} thread {} converted to fiber {}", pid, tid, id);
        Ok(id)
    }

    /// Create an idle fiber that starts at `entry(arg)` on the given stack
    ///
    /// The caller's thread must be converted. The engine does not install
    /// an exit path: `entry` must end by calling `fiber_exit` (or switch
    /// away for good), never by returning.
    ///
    /// # Safety
    ///
    /// `[stack_base, stack_base + stack_size)` must be writable memory that
    /// stays valid and unused by anything else for as long as the fiber may
    /// run, and its top must be 16-byte aligned.
    pub unsafe fn create_fiber(
        &self,
        pid: ProcessId,
        tid: ThreadId,
        entry: FiberEntry,
        arg: usize,
        stack_base: usize,
        stack_size: usize,
    ) -> FiberResult<FiberId> {
        let (process, _thread) = self.resolve(pid, tid)?;
        let id = process.allocate_fiber_id()?;
        let fiber = Fiber::created(id, tid, entry, arg, stack_base, stack_size)?;
        process.insert_fiber(fiber);

        kdebug!(
            "pid {} thread {} created fiber {} entry {:#x} stack {:#x}+{:#x}",
            pid, tid, id, entry as usize, stack_base, stack_size
        );
        Ok(id)
    }

    /// Suspend the fiber running in `tid` and run `target` in its place
    ///
    /// Returns `Ok(())` when some thread later switches back to the
    /// suspended fiber, which may happen on a different OS thread.
    ///
    /// # Safety
    ///
    /// - `pid`/`tid` must identify the calling OS thread.
    /// - Every fiber of the process must have a valid stack and, for
    ///   created fibers, an entry that never returns.
    /// - Nothing on the current stack may rely on staying on this OS thread
    ///   across the call (thread-local references, thread-bound guards).
    pub unsafe fn switch_to_fiber(
        &self,
        pid: ProcessId,
        tid: ThreadId,
        target_id: FiberId,
    ) -> FiberResult<()> {
        let (process, thread) = self.resolve(pid, tid)?;
        let target = process.fiber(target_id).ok_or(FiberError::NoSuchFiber)?;

        if let Err(state) = target.owner().try_claim(tid) {
            target.metrics().record_failed_activation();
            kdebug!("thread {} switch to fiber {} refused: {}", tid, target_id, state);
            return Err(FiberError::Busy);
        }

        let source_id = thread.active_fiber();
        let Some(source) = process.fiber(source_id) else {
            target.owner().release();
            return Err(FiberError::NoSuchFiber);
        };
        debug_assert_eq!(source.state().owner(), Some(tid));

        let now = now_ns();
        source.metrics().accumulate_running(now);
        thread.set_active_fiber(target_id);
        target.metrics().record_activation(now);
        tls::set_current_fiber(Some(target_id));

        if self.config.trace_switches() {
            ktrace!("thread {} switch fiber {} -> {}", tid, source_id, target_id);
        }

        let save = source.context_ptr();
        let load = target.context_ptr();
        let release = source.owner().as_ptr();

        // Rows of owned fibers are only removed by their owner or by
        // process cleanup, so both records outlive the hand-off without
        // pinning them from this (possibly never resumed) stack.
        drop(source);
        drop(target);
        drop(thread);
        drop(process);

        current_arch::switch_context(save, load, release);
        Ok(())
    }

    /// Allocate an FLS slot on the caller's active fiber
    pub fn fls_alloc(&self, pid: ProcessId, tid: ThreadId) -> FiberResult<usize> {
        self.active_fiber_record(pid, tid)?.with_locals(|l| l.alloc())
    }

    pub fn fls_free(&self, pid: ProcessId, tid: ThreadId, index: usize) -> FiberResult<()> {
        self.active_fiber_record(pid, tid)?.with_locals(|l| l.free(index))
    }

    pub fn fls_get_value(&self, pid: ProcessId, tid: ThreadId, index: usize) -> FiberResult<i64> {
        self.active_fiber_record(pid, tid)?.with_locals(|l| l.get(index))
    }

    pub fn fls_set_value(
        &self,
        pid: ProcessId,
        tid: ThreadId,
        index: usize,
        value: i64,
    ) -> FiberResult<()> {
        self.active_fiber_record(pid, tid)?
            .with_locals(|l| l.set(index, value))
    }

    /// Fiber currently executing in `tid`
    pub fn active_fiber(&self, pid: ProcessId, tid: ThreadId) -> FiberResult<FiberId> {
        let (_, thread) = self.resolve(pid, tid)?;
        Ok(thread.active_fiber())
    }

    /// Remove the caller's active fiber and its thread row
    ///
    /// This is the bookkeeping half of [`fiber_exit`](Self::fiber_exit):
    /// the fiber's context and FLS are released, and the thread no longer
    /// counts as converted.
    pub fn retire_active_fiber(&self, pid: ProcessId, tid: ThreadId) -> FiberResult<FiberId> {
        let (process, thread) = self.resolve(pid, tid)?;
        let id = thread.active_fiber();

        process.remove_thread(tid);
        if let Some(fiber) = process.remove_fiber(id) {
            fiber.with_locals(|l| l.clear());
        }
        tls::set_current_fiber(None);

        kdebug!("pid {} thread {} retired fiber {}", pid, tid, id);
        Ok(id)
    }

    /// Destroy the caller's active fiber and terminate the calling thread
    ///
    /// Only returns, with `NotConverted`, when the caller was never a fiber.
    /// Other fibers of the process are untouched; a suspended fiber that
    /// originally belonged to this thread can still be switched to from
    /// elsewhere.
    pub fn fiber_exit(&self, pid: ProcessId, tid: ThreadId) -> FiberResult<Infallible> {
        self.retire_active_fiber(pid, tid)?;
        CurrentPlatform::new().exit_current_thread()
    }

    /// Remove every row belonging to `pid`
    ///
    /// Must not race with fibers executing in that process. Returns the
    /// number of fibers removed (0 for an unknown pid).
    pub fn process_cleanup(&self, pid: ProcessId) -> usize {
        let Some(process) = self.registry.remove(pid) else {
            return 0;
        };
        let threads = process.thread_count();
        let fibers = process.clear();
        kinfo!("pid {} cleanup: {} fibers, {} threads", pid, fibers, threads);
        fibers
    }

    /// [`process_cleanup`](Self::process_cleanup) for every process
    pub fn global_cleanup(&self) -> usize {
        let total = self
            .registry
            .pids()
            .into_iter()
            .map(|pid| self.process_cleanup(pid))
            .sum();
        kinfo!("global cleanup: {} fibers", total);
        total
    }

    /// Read-only snapshot of one fiber
    pub fn fiber_info(&self, pid: ProcessId, id: FiberId) -> FiberResult<FiberInfo> {
        let process = self.registry.process(pid).ok_or(FiberError::NotConverted)?;
        let fiber = process.fiber(id).ok_or(FiberError::NoSuchFiber)?;
        Ok(FiberInfo::of(&fiber))
    }

    /// Snapshots of every fiber of `pid`, by ascending id
    pub fn fibers(&self, pid: ProcessId) -> FiberResult<Vec<FiberInfo>> {
        let process = self.registry.process(pid).ok_or(FiberError::NotConverted)?;
        Ok(process
            .fiber_ids()
            .into_iter()
            .filter_map(|id| process.fiber(id))
            .map(|f| FiberInfo::of(&f))
            .collect())
    }
}

impl Default for FiberEngine {
    fn default() -> Self {
        Self::new(FiberConfig::from_env())
    }
}
