//! # ufiber - user-level fibers
//!
//! Cooperative fibers on top of OS threads: a thread converts itself into a
//! fiber, creates more fibers, and hands its CPU to any idle fiber of the
//! process with [`switch_to_fiber`]. A fiber is not tied to the thread that
//! created it; whichever thread switches to it becomes its carrier.
//!
//! ## Quick Start
//!
//! ```ignore
//! use ufiber::{convert_thread_to_fiber, spawn_fiber, switch_to_fiber};
//!
//! let main = convert_thread_to_fiber()?;
//! let worker = spawn_fiber(move || loop {
//!     println!("in worker");
//!     unsafe { switch_to_fiber(main) }.ok();
//! })?;
//!
//! unsafe { switch_to_fiber(worker)? };   // prints, comes back
//! unsafe { switch_to_fiber(worker)? };   // prints again
//! ufiber::cleanup();
//! ```
//!
//! ## Fiber termination
//!
//! Fibers started through [`create_fiber`] or [`spawn_fiber`] run inside a
//! start shim: when the entry returns (or panics) the shim calls
//! [`fiber_exit`], which removes the fiber and terminates its carrier
//! thread. Fibers created with [`create_fiber_with_stack`] get no shim and
//! must call [`fiber_exit`] themselves.
//!
//! ## Environment
//!
//! - `UFIBER_STACK_SIZE`, `UFIBER_GUARD_PAGES`, `UFIBER_LOG_SWITCHES`
//! - `UFIBER_LOG_LEVEL`, `UFIBER_LOG_FLUSH`

pub mod transport;

use std::convert::Infallible;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::OnceLock;

use ahash::RandomState;
use dashmap::DashMap;

// Re-export core types
pub use ufiber_core::{
    FiberError, FiberId, FiberResult, FiberState, ProcessId, ThreadId, FLS_CAPACITY,
};
pub use ufiber_core::{kdebug, kerror, kinfo, kprint, kprintln, ktrace, kwarn};
pub use ufiber_core::kprint::{log_level, set_log_level, LogLevel};

pub use ufiber_runtime::{
    ConfigError, FiberConfig, FiberEngine, FiberEntry, FiberInfo, FiberStack,
};

pub use transport::{errno, status_code};

use ufiber_runtime::CurrentPlatform;

static ENGINE: OnceLock<FiberEngine> = OnceLock::new();
static LAUNCHES: OnceLock<DashMap<FiberId, Box<Launch>, RandomState>> = OnceLock::new();

type Start = Box<dyn FnOnce() + Send + 'static>;

/// Stack and pending start routine of a fiber created here
struct Launch {
    /// Taken by the fiber on its first activation
    start: AtomicPtr<Start>,
    stack: FiberStack,
}

impl Drop for Launch {
    fn drop(&mut self) {
        let start = self.start.swap(ptr::null_mut(), Ordering::AcqRel);
        if !start.is_null() {
            // SAFETY: produced by Box::into_raw and never taken.
            drop(unsafe { Box::from_raw(start) });
        }
    }
}

/// The process-wide engine
///
/// Configured from the environment on first use; an invalid configuration
/// is reported and replaced by the defaults.
pub fn engine() -> &'static FiberEngine {
    ENGINE.get_or_init(|| {
        let config = FiberConfig::from_env();
        let config = match config.validate() {
            Ok(()) => config,
            Err(e) => {
                kwarn!("{}; using defaults", e);
                FiberConfig::new()
            }
        };
        FiberEngine::new(config)
    })
}

fn launches() -> &'static DashMap<FiberId, Box<Launch>, RandomState> {
    LAUNCHES.get_or_init(|| DashMap::with_hasher(RandomState::new()))
}

#[inline]
fn ids() -> (ProcessId, ThreadId) {
    CurrentPlatform::new().current_ids()
}

/// Start shim for every fiber created by this crate
extern "C" fn fiber_start(arg: usize) {
    // SAFETY: `arg` is the fiber's Launch, which lives until cleanup.
    let launch = unsafe { &*(arg as *const Launch) };
    let start = launch.start.swap(ptr::null_mut(), Ordering::AcqRel);
    if !start.is_null() {
        // SAFETY: produced by Box::into_raw; the swap made it ours.
        let start = unsafe { Box::from_raw(start) };
        if panic::catch_unwind(AssertUnwindSafe(move || (*start)())).is_err() {
            kerror!("fiber panicked; exiting its thread");
        }
    }

    let Err(e) = fiber_exit();
    kerror!("fiber_exit from start shim failed: {}", e);
    std::process::abort();
}

/// Turn the calling thread into a fiber and return its id
pub fn convert_thread_to_fiber() -> FiberResult<FiberId> {
    let (pid, tid) = ids();
    engine().convert_thread_to_fiber(pid, tid)
}

/// Create an idle fiber that will run `f` on a freshly mapped stack
///
/// The caller must be a converted thread. Returning from `f` ends the
/// fiber and terminates whichever thread is carrying it at that point.
///
/// # Stack lifetime
///
/// The stack mapping and launch record outlive the fiber: they are only
/// released by [`cleanup`], even after `f` has returned. The exiting
/// carrier thread is still running on that stack between retiring the
/// fiber and its final `exit` syscall, and nothing observes that point.
/// A process that keeps spawning short-lived fibers therefore holds one
/// `stack_size + guard_pages` mapping per spawned fiber until it calls
/// [`cleanup`].
pub fn spawn_fiber<F>(f: F) -> FiberResult<FiberId>
where
    F: FnOnce() + Send + 'static,
{
    let (pid, tid) = ids();
    let engine = engine();
    engine.active_fiber(pid, tid)?;

    let config = engine.config();
    let stack = FiberStack::allocate(config.stack_size, config.guard_pages)?;
    let start: Box<Start> = Box::new(Box::new(f));
    let launch = Box::new(Launch {
        start: AtomicPtr::new(Box::into_raw(start)),
        stack,
    });

    let arg = &*launch as *const Launch as usize;
    // SAFETY: the stack is a private mapping kept alive with the Launch
    // record, and `fiber_start` never returns.
    let id = unsafe {
        engine.create_fiber(pid, tid, fiber_start, arg, launch.stack.base(), launch.stack.size())?
    };
    launches().insert(id, launch);
    Ok(id)
}

/// Create an idle fiber that will run `entry(arg)` on a freshly mapped stack
///
/// Same lifetime rules as [`spawn_fiber`].
pub fn create_fiber(entry: extern "C" fn(usize), arg: usize) -> FiberResult<FiberId> {
    spawn_fiber(move || entry(arg))
}

/// Create an idle fiber on caller-supplied stack memory
///
/// # Safety
///
/// The stack must be writable, stay valid while the fiber can run, and
/// have a 16-byte aligned top. `entry` must end with [`fiber_exit`] or
/// switch away for good; it must never return.
pub unsafe fn create_fiber_with_stack(
    entry: FiberEntry,
    arg: usize,
    stack_base: usize,
    stack_size: usize,
) -> FiberResult<FiberId> {
    let (pid, tid) = ids();
    engine().create_fiber(pid, tid, entry, arg, stack_base, stack_size)
}

/// Suspend the calling fiber and run `target` on this thread
///
/// Returns once another switch names the suspended fiber again, possibly
/// on a different OS thread.
///
/// # Safety
///
/// Nothing on the caller's stack may depend on staying on the current OS
/// thread across the call (thread-local borrows, thread-bound guards).
pub unsafe fn switch_to_fiber(target: FiberId) -> FiberResult<()> {
    let (pid, tid) = ids();
    engine().switch_to_fiber(pid, tid, target)
}

pub fn fls_alloc() -> FiberResult<usize> {
    let (pid, tid) = ids();
    engine().fls_alloc(pid, tid)
}

pub fn fls_free(index: usize) -> FiberResult<()> {
    let (pid, tid) = ids();
    engine().fls_free(pid, tid, index)
}

pub fn fls_get_value(index: usize) -> FiberResult<i64> {
    let (pid, tid) = ids();
    engine().fls_get_value(pid, tid, index)
}

pub fn fls_set_value(index: usize, value: i64) -> FiberResult<()> {
    let (pid, tid) = ids();
    engine().fls_set_value(pid, tid, index, value)
}

/// Destroy the calling fiber and terminate the calling thread
///
/// Only returns, with `NotConverted`, if the caller is not a fiber.
pub fn fiber_exit() -> FiberResult<Infallible> {
    let (pid, tid) = ids();
    engine().fiber_exit(pid, tid)
}

/// Fiber running on the calling thread, if it is converted
pub fn current_fiber() -> Option<FiberId> {
    let (pid, tid) = ids();
    engine().active_fiber(pid, tid).ok()
}

pub fn fiber_info(id: FiberId) -> FiberResult<FiberInfo> {
    engine().fiber_info(CurrentPlatform::new().current_process(), id)
}

/// Snapshots of every fiber of this process
pub fn fibers() -> FiberResult<Vec<FiberInfo>> {
    engine().fibers(CurrentPlatform::new().current_process())
}

/// Drop every fiber and thread row of this process and free their stacks
///
/// No other thread may be running a fiber of this process. If the caller
/// is itself on a stack mapped here, that one mapping is leaked instead
/// of freed. Returns the number of fibers removed.
pub fn cleanup() -> usize {
    let (pid, tid) = ids();
    let engine = engine();
    let running_on = engine.active_fiber(pid, tid).ok();

    let removed = engine.process_cleanup(pid);

    if let Some((id, launch)) = running_on.and_then(|id| launches().remove(&id)) {
        kdebug!("cleanup: keeping stack of running fiber {}", id);
        Box::leak(launch);
    }
    launches().clear();
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize};
    use std::sync::{Arc, Mutex, MutexGuard};
    use std::time::{Duration, Instant};

    /// Tests share the process-wide engine
    static SERIAL: Mutex<()> = Mutex::new(());

    fn serial() -> MutexGuard<'static, ()> {
        SERIAL.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            if Instant::now() > deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }

    fn thread_gone(tid: u32) -> bool {
        !std::path::Path::new(&format!("/proc/self/task/{}", tid)).exists()
    }

    #[test]
    fn test_convert_twice_on_fresh_thread() {
        let _g = serial();
        std::thread::spawn(|| {
            assert_eq!(fls_alloc(), Err(FiberError::NotConverted));
            assert_eq!(current_fiber(), None);
            let id = convert_thread_to_fiber().unwrap();
            assert_eq!(convert_thread_to_fiber(), Err(FiberError::AlreadyConverted));
            assert_eq!(current_fiber(), Some(id));
            assert!(spawn_fiber(|| {}).is_ok());
        })
        .join()
        .unwrap();
        assert_eq!(cleanup(), 2);
    }

    #[test]
    fn test_spawn_requires_conversion() {
        let _g = serial();
        std::thread::spawn(|| {
            assert_eq!(spawn_fiber(|| {}), Err(FiberError::NotConverted));
            assert_eq!(
                status_code(unsafe { switch_to_fiber(FiberId::new(1)) }),
                -(libc::EPERM as i64)
            );
        })
        .join()
        .unwrap();
        assert!(launches().is_empty());
    }

    #[test]
    fn test_closure_ping_pong() {
        let _g = serial();
        let main = convert_thread_to_fiber().unwrap();
        let main_slot = fls_alloc().unwrap();
        fls_set_value(main_slot, -1).unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let fiber_slot = Arc::new(AtomicUsize::new(usize::MAX));
        let (h, s) = (Arc::clone(&hits), Arc::clone(&fiber_slot));
        let worker = spawn_fiber(move || {
            let slot = fls_alloc().unwrap();
            s.store(slot, Ordering::SeqCst);
            loop {
                let n = h.fetch_add(1, Ordering::SeqCst) + 1;
                fls_set_value(slot, n as i64 * 10).unwrap();
                unsafe { switch_to_fiber(main) }.unwrap();
            }
        })
        .unwrap();

        for round in 1..=3 {
            unsafe { switch_to_fiber(worker) }.unwrap();
            assert_eq!(hits.load(Ordering::SeqCst), round);
            assert_eq!(current_fiber(), Some(main));
            assert_eq!(fls_get_value(main_slot), Ok(-1));
        }
        // Fresh fiber, fresh table
        assert_eq!(fiber_slot.load(Ordering::SeqCst), 0);

        let info = fiber_info(worker).unwrap();
        assert!(!info.running);
        assert_eq!(info.activations, 3);
        assert!(info.stack_size >= engine().config().stack_size);
        assert_eq!(fibers().unwrap().len(), 2);

        assert_eq!(cleanup(), 2);
        assert_eq!(current_fiber(), None);
        assert!(launches().is_empty());
    }

    struct Scenario {
        home: AtomicU32,
        arg: AtomicUsize,
        f1_running: AtomicBool,
        t2_done: AtomicBool,
        t2_status: AtomicI64,
    }

    static SCENARIO: Scenario = Scenario {
        home: AtomicU32::new(0),
        arg: AtomicUsize::new(0),
        f1_running: AtomicBool::new(false),
        t2_done: AtomicBool::new(false),
        t2_status: AtomicI64::new(0),
    };

    extern "C" fn g(arg: usize) {
        SCENARIO.arg.store(arg, Ordering::SeqCst);
        SCENARIO.f1_running.store(true, Ordering::SeqCst);
        wait_for(|| SCENARIO.t2_done.load(Ordering::SeqCst));
        let home = FiberId::new(SCENARIO.home.load(Ordering::SeqCst));
        unsafe { switch_to_fiber(home) }.unwrap();
    }

    #[test]
    fn test_switch_into_created_fiber_and_busy_from_second_thread() {
        let _g = serial();
        let f0 = convert_thread_to_fiber().unwrap();
        SCENARIO.home.store(f0.as_u32(), Ordering::SeqCst);

        let f1 = create_fiber(g, 7).unwrap();
        assert!(!fiber_info(f1).unwrap().running);

        let t2 = std::thread::spawn(move || {
            convert_thread_to_fiber().unwrap();
            wait_for(|| SCENARIO.f1_running.load(Ordering::SeqCst));
            let r = unsafe { switch_to_fiber(f1) };
            SCENARIO.t2_status.store(status_code(r), Ordering::SeqCst);
            SCENARIO.t2_done.store(true, Ordering::SeqCst);
            r
        });

        unsafe { switch_to_fiber(f1) }.unwrap();

        assert_eq!(SCENARIO.arg.load(Ordering::SeqCst), 7);
        assert_eq!(t2.join().unwrap(), Err(FiberError::Busy));
        assert_eq!(
            SCENARIO.t2_status.load(Ordering::SeqCst),
            -(libc::EBUSY as i64)
        );
        assert_eq!(current_fiber(), Some(f0));

        let info = fiber_info(f1).unwrap();
        assert!(!info.running);
        assert_eq!(info.activations, 1);
        assert_eq!(info.failed_activations, 1);
        assert!(fiber_info(f0).unwrap().running);

        assert_eq!(cleanup(), 3);
    }

    #[test]
    fn test_fiber_end_exits_carrier_thread() {
        let _g = serial();
        for panics in [false, true] {
            let ran = Arc::new(AtomicBool::new(false));
            let os_tid = Arc::new(AtomicU32::new(0));
            let ids = Arc::new(Mutex::new(None));

            let (r, t, i) = (Arc::clone(&ran), Arc::clone(&os_tid), Arc::clone(&ids));
            let _detached = std::thread::spawn(move || {
                t.store(CurrentPlatform::new().current_thread().as_u32(), Ordering::SeqCst);
                let home = convert_thread_to_fiber().unwrap();
                let worker = spawn_fiber(move || {
                    r.store(true, Ordering::SeqCst);
                    if panics {
                        panic!("worker failed");
                    }
                })
                .unwrap();
                *i.lock().unwrap() = Some((home, worker));
                unsafe { switch_to_fiber(worker) }.unwrap();
                unreachable!("carrier thread should have exited");
            });

            assert!(wait_for(|| os_tid.load(Ordering::SeqCst) != 0));
            let tid = os_tid.load(Ordering::SeqCst);
            assert!(wait_for(|| thread_gone(tid)));
            assert!(ran.load(Ordering::SeqCst));

            let (home, worker) = ids.lock().unwrap().unwrap();
            assert_eq!(fiber_info(worker).err(), Some(FiberError::NoSuchFiber));
            // The thread's own fiber was suspended, not destroyed
            let home_info = fiber_info(home).unwrap();
            assert!(!home_info.running);

            // The exited fiber's stack stays mapped until cleanup
            assert!(launches().contains_key(&worker));
            assert_eq!(cleanup(), 1);
            assert!(launches().is_empty());
        }
    }
}
