//! Fiber-local storage allocator
//!
//! Every fiber owns a fixed table of [`FLS_CAPACITY`] 8-byte slots. Slot
//! allocation is a hybrid of two bitmaps and a stack of free runs:
//!
//! - `used` has a bit per allocated index.
//! - `runs` holds the lowest index of each contiguous free run that has a
//!   node; the most recently pushed node is the head.
//! - `pointed` has a bit per index that some node currently names.
//!
//! Allocation pops the head run, hands out its index, and (when the next
//! index is free and not already the start of another run) slides the node
//! forward in place. Freeing pushes a new run only when the freed index has
//! no free predecessor; otherwise the predecessor's run reaches it by
//! sliding. Runs are never merged backwards.
//!
//! Invariants, checked by [`FlsTable::check_invariants`] in tests:
//! - no index is both used and pointed
//! - each node names a distinct free index
//! - every free index is reachable from some node by sliding forward over
//!   free, unpointed indices
//!
//! The table is only touched by the thread that owns the fiber, so it is
//! plain data with no interior synchronization.

use crate::bitmap::SlotBitmap;
use crate::error::{FiberError, FiberResult};

/// Number of FLS slots per fiber
pub const FLS_CAPACITY: usize = 4096;

/// Per-fiber slot table (exists once the fiber first allocates)
pub struct FlsTable {
    values: Box<[i64]>,
    used: SlotBitmap,
    pointed: SlotBitmap,
    /// Free-run heads; the last element is the list head
    runs: Vec<usize>,
    allocated: usize,
}

impl FlsTable {
    /// Build a table and hand out its first index
    ///
    /// Index 0 is returned allocated and a single run node is seeded at 1.
    /// All storage is reserved fallibly; on failure nothing is kept.
    pub fn try_init(capacity: usize) -> FiberResult<(Self, usize)> {
        let mut values = Vec::new();
        values
            .try_reserve_exact(capacity)
            .map_err(|_| FiberError::AllocationFailure)?;
        values.resize(capacity, 0i64);

        let mut runs = Vec::new();
        runs.try_reserve(16)
            .map_err(|_| FiberError::AllocationFailure)?;

        let mut table = Self {
            values: values.into_boxed_slice(),
            used: SlotBitmap::try_new(capacity)?,
            pointed: SlotBitmap::try_new(capacity)?,
            runs,
            allocated: 0,
        };

        table.used.set(0);
        table.allocated = 1;
        if capacity > 1 {
            table.runs.push(1);
            table.pointed.set(1);
        }
        Ok((table, 0))
    }

    /// Table capacity
    #[inline]
    pub fn capacity(&self) -> usize {
        self.values.len()
    }

    /// Number of allocated slots
    #[inline]
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// Number of free-run nodes
    #[inline]
    pub fn free_runs(&self) -> usize {
        self.runs.len()
    }

    /// Allocate the slot named by the head run
    pub fn alloc(&mut self) -> FiberResult<usize> {
        let Some(head) = self.runs.last_mut() else {
            return Err(FiberError::Full);
        };

        let index = *head;
        let next = index + 1;
        self.used.set(index);
        self.pointed.clear(index);

        if next < self.values.len() && !self.used.test(next) && !self.pointed.test(next) {
            *head = next;
            self.pointed.set(next);
        } else {
            self.runs.pop();
        }

        self.values[index] = 0;
        self.allocated += 1;
        Ok(index)
    }

    /// Return `index` to the free pool
    pub fn free(&mut self, index: usize) -> FiberResult<()> {
        self.check_allocated(index)?;

        let starts_run = index == 0 || self.used.test(index - 1);
        if starts_run {
            self.runs
                .try_reserve(1)
                .map_err(|_| FiberError::AllocationFailure)?;
        }

        self.used.clear(index);
        self.allocated -= 1;
        if starts_run {
            self.runs.push(index);
            self.pointed.set(index);
        }
        Ok(())
    }

    pub fn get(&self, index: usize) -> FiberResult<i64> {
        self.check_allocated(index)?;
        Ok(self.values[index])
    }

    pub fn set(&mut self, index: usize, value: i64) -> FiberResult<()> {
        self.check_allocated(index)?;
        self.values[index] = value;
        Ok(())
    }

    #[inline]
    fn check_allocated(&self, index: usize) -> FiberResult<()> {
        if index >= self.values.len() {
            return Err(FiberError::OutOfRange);
        }
        if !self.used.test(index) {
            return Err(FiberError::NotAllocated);
        }
        Ok(())
    }

    /// Verify the structural invariants, returning a description of the
    /// first violation found.
    pub fn check_invariants(&self) -> Result<(), String> {
        let cap = self.values.len();

        for i in self.pointed.iter_set() {
            if self.used.test(i) {
                return Err(format!("index {} is both used and pointed", i));
            }
        }

        let mut named = SlotBitmap::try_new(cap).map_err(|e| e.to_string())?;
        for &r in &self.runs {
            if r >= cap || self.used.test(r) || !self.pointed.test(r) || named.test(r) {
                return Err(format!("bad run node at {}", r));
            }
            named.set(r);
        }
        if named.count() != self.pointed.count() {
            return Err("pointed bitmap disagrees with run list".to_string());
        }

        let mut reachable = SlotBitmap::try_new(cap).map_err(|e| e.to_string())?;
        for &r in &self.runs {
            let mut i = r;
            while i < cap && !self.used.test(i) && (i == r || !self.pointed.test(i)) {
                reachable.set(i);
                i += 1;
            }
        }
        for i in 0..cap {
            if !self.used.test(i) && !reachable.test(i) {
                return Err(format!("free index {} is unreachable", i));
            }
        }

        if self.used.count() != self.allocated {
            return Err("allocation count out of sync".to_string());
        }
        Ok(())
    }
}

impl core::fmt::Debug for FlsTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FlsTable")
            .field("capacity", &self.capacity())
            .field("allocated", &self.allocated)
            .field("free_runs", &self.runs.len())
            .finish()
    }
}

/// Lazily created FLS state of one fiber
#[derive(Debug)]
pub struct FiberLocals {
    table: Option<FlsTable>,
    capacity: usize,
}

impl FiberLocals {
    pub const fn new() -> Self {
        Self::with_capacity(FLS_CAPACITY)
    }

    /// Locals with a non-default table size
    pub const fn with_capacity(capacity: usize) -> Self {
        Self {
            table: None,
            capacity,
        }
    }

    /// Whether the slot table has been created
    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.table.is_some()
    }

    /// Number of allocated slots
    pub fn allocated(&self) -> usize {
        self.table.as_ref().map_or(0, FlsTable::allocated)
    }

    /// Underlying table, if created
    pub fn table(&self) -> Option<&FlsTable> {
        self.table.as_ref()
    }

    pub fn alloc(&mut self) -> FiberResult<usize> {
        match &mut self.table {
            Some(table) => table.alloc(),
            None => {
                let (table, index) = FlsTable::try_init(self.capacity)?;
                self.table = Some(table);
                Ok(index)
            }
        }
    }

    pub fn free(&mut self, index: usize) -> FiberResult<()> {
        self.check_range(index)?;
        self.table
            .as_mut()
            .ok_or(FiberError::NotAllocated)?
            .free(index)
    }

    pub fn get(&self, index: usize) -> FiberResult<i64> {
        self.check_range(index)?;
        self.table.as_ref().ok_or(FiberError::NotAllocated)?.get(index)
    }

    pub fn set(&mut self, index: usize, value: i64) -> FiberResult<()> {
        self.check_range(index)?;
        self.table
            .as_mut()
            .ok_or(FiberError::NotAllocated)?
            .set(index, value)
    }

    #[inline]
    fn check_range(&self, index: usize) -> FiberResult<()> {
        if index >= self.capacity {
            Err(FiberError::OutOfRange)
        } else {
            Ok(())
        }
    }

    /// Drop the table and every value in it
    pub fn clear(&mut self) {
        self.table = None;
    }
}

impl Default for FiberLocals {
    fn default() -> Self {
        Self::new()
    }
}
