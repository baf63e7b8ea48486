//! Per-fiber lifecycle counters
//!
//! Written by whichever thread owns the fiber (activations, running time)
//! or by any thread that loses a claim race (failed activations). Readers
//! take a [`MetricsSnapshot`]; individual counters are consistent, the
//! snapshot as a whole is not.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::id::ThreadId;

/// Sentinel for "never activated"
const NEVER: u64 = u64::MAX;

#[derive(Debug)]
pub struct FiberMetrics {
    /// Thread that converted or created this fiber
    creator: ThreadId,
    /// Entry address (0 for converted threads)
    entry_point: usize,
    activations: AtomicU64,
    failed_activations: AtomicU64,
    total_running_ns: AtomicU64,
    last_activation_ns: AtomicU64,
}

/// Point-in-time copy of [`FiberMetrics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub creator: ThreadId,
    pub entry_point: usize,
    pub activations: u64,
    pub failed_activations: u64,
    pub total_running_ns: u64,
    pub last_activation_ns: Option<u64>,
}

impl FiberMetrics {
    /// Metrics for a fiber that has never run
    pub const fn new(creator: ThreadId, entry_point: usize) -> Self {
        Self {
            creator,
            entry_point,
            activations: AtomicU64::new(0),
            failed_activations: AtomicU64::new(0),
            total_running_ns: AtomicU64::new(0),
            last_activation_ns: AtomicU64::new(NEVER),
        }
    }

    /// Metrics for a fiber that starts out running (a converted thread)
    pub fn running_since(creator: ThreadId, now_ns: u64) -> Self {
        let m = Self::new(creator, 0);
        m.record_activation(now_ns);
        m
    }

    #[inline]
    pub fn creator(&self) -> ThreadId {
        self.creator
    }

    #[inline]
    pub fn entry_point(&self) -> usize {
        self.entry_point
    }

    /// Count a successful claim starting at `now_ns`
    #[inline]
    pub fn record_activation(&self, now_ns: u64) {
        self.activations.fetch_add(1, Ordering::Relaxed);
        self.last_activation_ns.store(now_ns, Ordering::Relaxed);
    }

    /// Count a claim that lost to the current owner
    #[inline]
    pub fn record_failed_activation(&self) {
        self.failed_activations.fetch_add(1, Ordering::Relaxed);
    }

    /// Fold the time since the last activation into the running total
    #[inline]
    pub fn accumulate_running(&self, now_ns: u64) {
        let since = self.last_activation_ns.load(Ordering::Relaxed);
        if since != NEVER {
            self.total_running_ns
                .fetch_add(now_ns.saturating_sub(since), Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let last = self.last_activation_ns.load(Ordering::Relaxed);
        MetricsSnapshot {
            creator: self.creator,
            entry_point: self.entry_point,
            activations: self.activations.load(Ordering::Relaxed),
            failed_activations: self.failed_activations.load(Ordering::Relaxed),
            total_running_ns: self.total_running_ns.load(Ordering::Relaxed),
            last_activation_ns: (last != NEVER).then_some(last),
        }
    }
}
