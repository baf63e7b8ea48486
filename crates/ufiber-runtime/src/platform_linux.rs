//! Linux platform implementation

use nix::unistd::{getpid, gettid};
use ufiber_core::{ProcessId, ThreadId};

/// Linux platform handler
pub struct LinuxPlatform;

impl LinuxPlatform {
    pub fn new() -> Self {
        Self
    }

    /// Process id (tgid) of the caller
    #[inline]
    pub fn current_process(&self) -> ProcessId {
        ProcessId::new(getpid().as_raw() as u32)
    }

    /// Kernel thread id of the caller
    ///
    /// Not cached: a fiber may resume on a different thread than the one it
    /// last ran on.
    #[inline]
    pub fn current_thread(&self) -> ThreadId {
        // Linux never hands out tid 0 to a user thread.
        ThreadId::new(gettid().as_raw() as u32).unwrap_or_else(|| std::process::abort())
    }

    #[inline]
    pub fn current_ids(&self) -> (ProcessId, ThreadId) {
        (self.current_process(), self.current_thread())
    }

    /// System page size
    pub fn page_size(&self) -> usize {
        // SAFETY: sysconf has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 { size as usize } else { 4096 }
    }

    /// Terminate the calling OS thread only
    ///
    /// Uses the raw exit syscall: no thread-local destructors run and a
    /// `JoinHandle` for the thread never completes.
    pub fn exit_current_thread(&self) -> ! {
        // SAFETY: SYS_exit ends only the calling thread.
        unsafe {
            libc::syscall(libc::SYS_exit, 0);
        }
        std::process::abort()
    }
}

impl Default for LinuxPlatform {
    fn default() -> Self {
        Self::new()
    }
}
