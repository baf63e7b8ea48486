//! Process / Thread / Fiber registry
//!
//! Three levels of concurrent maps (`dashmap` shards, `ahash` hasher):
//! processes by pid, and per process its threads by tid and fibers by id.
//! Lookups hand out `Arc` clones so no shard guard outlives the call that
//! took it; in particular none is ever held across a context switch.
//!
//! Lock order, when two maps are touched together: `threads` before
//! `fibers`. Nothing takes a process-map guard while holding a per-process
//! one.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use ahash::RandomState;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use ufiber_core::{FiberError, FiberId, FiberIdCounter, FiberResult, ProcessId, ThreadId};

use crate::fiber::Fiber;

/// A converted OS thread
#[derive(Debug)]
pub struct Thread {
    tid: ThreadId,
    /// Raw id of the fiber currently executing in this thread
    active: AtomicU32,
}

impl Thread {
    fn new(tid: ThreadId, active: FiberId) -> Self {
        Self {
            tid,
            active: AtomicU32::new(active.as_u32()),
        }
    }

    #[inline]
    pub fn tid(&self) -> ThreadId {
        self.tid
    }

    #[inline]
    pub fn active_fiber(&self) -> FiberId {
        FiberId::new(self.active.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_active_fiber(&self, id: FiberId) {
        self.active.store(id.as_u32(), Ordering::Release);
    }
}

/// Per-process tables
pub struct Process {
    pid: ProcessId,
    threads: DashMap<ThreadId, Arc<Thread>, RandomState>,
    fibers: DashMap<FiberId, Arc<Fiber>, RandomState>,
    fiber_ids: FiberIdCounter,
}

impl Process {
    fn new(pid: ProcessId) -> Self {
        Self {
            pid,
            threads: DashMap::with_hasher(RandomState::new()),
            fibers: DashMap::with_hasher(RandomState::new()),
            fiber_ids: FiberIdCounter::new(),
        }
    }

    #[inline]
    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn thread(&self, tid: ThreadId) -> Option<Arc<Thread>> {
        self.threads.get(&tid).map(|t| Arc::clone(t.value()))
    }

    pub fn fiber(&self, id: FiberId) -> Option<Arc<Fiber>> {
        self.fibers.get(&id).map(|f| Arc::clone(f.value()))
    }

    /// Next fiber id; never reused within this process
    pub fn allocate_fiber_id(&self) -> FiberResult<FiberId> {
        self.fiber_ids.next().ok_or(FiberError::AllocationFailure)
    }

    /// Register `tid` together with the fiber it becomes
    ///
    /// `build` runs only when `tid` is not yet registered, and receives the
    /// freshly allocated id. The fiber row is inserted before the thread
    /// row so an `activeFiber` never names a missing fiber.
    pub fn register_thread(
        &self,
        tid: ThreadId,
        build: impl FnOnce(FiberId) -> Fiber,
    ) -> FiberResult<FiberId> {
        match self.threads.entry(tid) {
            Entry::Occupied(_) => Err(FiberError::AlreadyConverted),
            Entry::Vacant(slot) => {
                let id = self.allocate_fiber_id()?;
                self.fibers.insert(id, Arc::new(build(id)));
                slot.insert(Arc::new(Thread::new(tid, id)));
                Ok(id)
            }
        }
    }

    /// Publish a fully built fiber
    pub fn insert_fiber(&self, fiber: Fiber) -> FiberId {
        let id = fiber.id();
        self.fibers.insert(id, Arc::new(fiber));
        id
    }

    pub fn remove_fiber(&self, id: FiberId) -> Option<Arc<Fiber>> {
        self.fibers.remove(&id).map(|(_, f)| f)
    }

    pub fn remove_thread(&self, tid: ThreadId) -> Option<Arc<Thread>> {
        self.threads.remove(&tid).map(|(_, t)| t)
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub fn fiber_count(&self) -> usize {
        self.fibers.len()
    }

    /// Ids of all live fibers, ascending
    pub fn fiber_ids(&self) -> Vec<FiberId> {
        let mut ids: Vec<FiberId> = self.fibers.iter().map(|f| *f.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Drop every thread and fiber row; returns how many fibers went
    pub fn clear(&self) -> usize {
        self.threads.clear();
        let n = self.fibers.len();
        self.fibers.clear();
        n
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("threads", &self.threads.len())
            .field("fibers", &self.fibers.len())
            .field("last_fiber_id", &self.fiber_ids.last())
            .finish()
    }
}

/// Top-level table of processes
pub struct Registry {
    processes: DashMap<ProcessId, Arc<Process>, RandomState>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            processes: DashMap::with_hasher(RandomState::new()),
        }
    }

    /// Process row for `pid`, created if absent
    ///
    /// Only the insert-if-absent step is serialized (one shard write lock).
    pub fn get_or_create(&self, pid: ProcessId) -> Arc<Process> {
        if let Some(p) = self.process(pid) {
            return p;
        }
        Arc::clone(
            self.processes
                .entry(pid)
                .or_insert_with(|| Arc::new(Process::new(pid)))
                .value(),
        )
    }

    pub fn process(&self, pid: ProcessId) -> Option<Arc<Process>> {
        self.processes.get(&pid).map(|p| Arc::clone(p.value()))
    }

    pub fn remove(&self, pid: ProcessId) -> Option<Arc<Process>> {
        self.processes.remove(&pid).map(|(_, p)| p)
    }

    pub fn pids(&self) -> Vec<ProcessId> {
        self.processes.iter().map(|p| *p.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
