//! Fixed-size bitmaps for FLS bookkeeping
//!
//! Plain (non-atomic) `u64` blocks: FLS structures are only ever touched by
//! the thread that currently owns the fiber, so no synchronization is needed
//! here.

use crate::error::{FiberError, FiberResult};

/// Number of bits per block
const BITS_PER_BLOCK: usize = 64;

/// Bitmap over indices `[0, len)`
pub struct SlotBitmap {
    /// Bitmap blocks (each u64 holds 64 index bits)
    blocks: Box<[u64]>,

    /// Number of valid bits
    len: usize,
}

impl SlotBitmap {
    /// Allocate an all-clear bitmap for `len` indices
    ///
    /// Storage is reserved fallibly so that exhaustion surfaces as
    /// `AllocationFailure` instead of aborting.
    pub fn try_new(len: usize) -> FiberResult<Self> {
        let num_blocks = len.div_ceil(BITS_PER_BLOCK);
        let mut blocks = Vec::new();
        blocks
            .try_reserve_exact(num_blocks)
            .map_err(|_| FiberError::AllocationFailure)?;
        blocks.resize(num_blocks, 0u64);

        Ok(Self {
            blocks: blocks.into_boxed_slice(),
            len,
        })
    }

    /// Number of indices covered
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    fn locate(idx: usize) -> (usize, u64) {
        (idx / BITS_PER_BLOCK, 1u64 << (idx % BITS_PER_BLOCK))
    }

    /// Set bit `idx`. Out-of-range indices are ignored.
    #[inline]
    pub fn set(&mut self, idx: usize) {
        if idx >= self.len {
            return;
        }
        let (block, mask) = Self::locate(idx);
        self.blocks[block] |= mask;
    }

    /// Clear bit `idx`. Out-of-range indices are ignored.
    #[inline]
    pub fn clear(&mut self, idx: usize) {
        if idx >= self.len {
            return;
        }
        let (block, mask) = Self::locate(idx);
        self.blocks[block] &= !mask;
    }

    /// Test bit `idx`. Out-of-range indices read as clear.
    #[inline]
    pub fn test(&self, idx: usize) -> bool {
        if idx >= self.len {
            return false;
        }
        let (block, mask) = Self::locate(idx);
        self.blocks[block] & mask != 0
    }

    /// Number of set bits
    pub fn count(&self) -> usize {
        self.blocks.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Iterate over the set indices in ascending order
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        self.blocks
            .iter()
            .enumerate()
            .flat_map(|(block_idx, &block)| {
                let mut bits = block;
                std::iter::from_fn(move || {
                    if bits == 0 {
                        return None;
                    }
                    let bit = bits.trailing_zeros() as usize;
                    bits &= bits - 1;
                    Some(block_idx * BITS_PER_BLOCK + bit)
                })
            })
    }
}

impl core::fmt::Debug for SlotBitmap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SlotBitmap")
            .field("len", &self.len)
            .field("set", &self.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_clear_test() {
        let mut bm = SlotBitmap::try_new(130).unwrap();
        assert_eq!(bm.len(), 130);
        assert!(!bm.test(0));

        bm.set(0);
        bm.set(63);
        bm.set(64);
        bm.set(129);
        assert!(bm.test(0) && bm.test(63) && bm.test(64) && bm.test(129));
        assert_eq!(bm.count(), 4);

        bm.clear(63);
        assert!(!bm.test(63));
        assert_eq!(bm.count(), 3);
    }

    #[test]
    fn test_out_of_range_ignored() {
        let mut bm = SlotBitmap::try_new(10).unwrap();
        bm.set(10);
        bm.set(1000);
        assert!(!bm.test(10));
        assert_eq!(bm.count(), 0);
    }

    #[test]
    fn test_iter_set() {
        let mut bm = SlotBitmap::try_new(256).unwrap();
        for i in [3, 64, 65, 200] {
            bm.set(i);
        }
        assert_eq!(bm.iter_set().collect::<Vec<_>>(), vec![3, 64, 65, 200]);
    }
}
