// SPDX-License-Identifier: MPL-2.0

//! File-block reservoir (spec.md §4.D.3, §5): a per-volume LIFO pool of
//! pre-carved blocks for small writes, so a single-block append doesn't pay
//! for a full buddy-allocator descent on every call.
//!
//! The lock here is [`crate::os::SpinLock`], never a blocking `Mutex`: the
//! reservoir is taken on the hot path of every small write, and spec.md §5
//! requires it never be held across a suspension point (a buddy refill,
//! which does real work and must run with the lock released).

use crate::buddy::BuddyAllocator;
use crate::geometry::BlockId;
use crate::os::SpinLock;
use crate::prelude::*;

/// How many blocks to carve out of the buddy allocator on a refill, as an
/// order (so the refill itself is a single buddy allocation, not `REFILL`
/// separate ones).
const REFILL_ORDER: u32 = 2;

struct Pool {
    blocks: Vec<BlockId>,
}

/// A per-volume LIFO pool of pre-allocated blocks.
pub struct Reservoir {
    pool: SpinLock<Pool>,
    low_watermark: usize,
}

impl Reservoir {
    pub fn new() -> Self {
        Self {
            pool: SpinLock::new(Pool { blocks: Vec::new() }),
            low_watermark: 1,
        }
    }

    /// Takes one block from the pool, refilling from `buddy` first if the
    /// pool has fallen to its low watermark. The refill call itself happens
    /// with the spin lock released.
    pub fn take(&self, buddy: &BuddyAllocator) -> Result<BlockId> {
        {
            let pool = self.pool.lock();
            if pool.blocks.len() > self.low_watermark {
                drop(pool);
                return self.pop(buddy, false);
            }
        }
        self.pop(buddy, true)
    }

    fn pop(&self, buddy: &BuddyAllocator, refill_first: bool) -> Result<BlockId> {
        if refill_first {
            self.refill(buddy)?;
        }
        let mut pool = self.pool.lock();
        if let Some(blkno) = pool.blocks.pop() {
            return Ok(blkno);
        }
        drop(pool);
        // Refill failed to leave anything behind (e.g. the buddy allocator
        // itself only had exactly one order-0 block free); fall back to a
        // direct allocation rather than erroring out early.
        buddy.alloc(0)
    }

    /// Carves `2^REFILL_ORDER` fresh blocks out of `buddy` and pushes them
    /// onto the pool. Never called with the spin lock held.
    fn refill(&self, buddy: &BuddyAllocator) -> Result<()> {
        let order = REFILL_ORDER.min(buddy.geometry().orders - 1);
        let base = match buddy.alloc(order) {
            Ok(base) => base,
            Err(e) if e.errno() == NoSpace && order > 0 => {
                // Retry at order 0 once the preferred bulk size doesn't fit.
                debug!("[Reservoir] refill at order {order} had no room, retrying at order 0");
                buddy.alloc(0)?
            }
            Err(e) => return Err(e),
        };
        let count = 1u64 << order;
        trace!("[Reservoir] refilled {count} block(s) starting at {base}");
        let mut pool = self.pool.lock();
        // Pushed highest-first so `take`'s LIFO pop hands the batch out in
        // ascending order: consecutive callers within one refill see
        // consecutive block numbers, same as the buddy allocator itself
        // would produce one block at a time.
        pool.blocks.extend((0..count).rev().map(|i| base + i));
        Ok(())
    }

    /// Returns an unused block to the pool instead of freeing it through
    /// the buddy allocator, for a caller that over-reserved and wants to
    /// give the surplus back for the next small write.
    pub fn give_back(&self, blkno: BlockId) {
        self.pool.lock().blocks.push(blkno);
    }

    /// Returns every block still held in the pool to `buddy`, one at a
    /// time through `free_extent`. Called once per transaction commit
    /// (spec.md §4.D.3): a reservoir's stock is this transaction's dirty-view
    /// allocation and must not silently carry into the next as untracked,
    /// already-allocated storage.
    pub fn drain(&self, buddy: &BuddyAllocator) -> Result<()> {
        let blocks = std::mem::take(&mut self.pool.lock().blocks);
        if !blocks.is_empty() {
            debug!("[Reservoir] draining {} block(s) back to the buddy allocator at commit", blocks.len());
        }
        for blkno in blocks {
            buddy.free_extent(blkno, 1)?;
        }
        Ok(())
    }

    /// Empties the pool without returning its contents through the buddy
    /// allocator. Used on abort: `buddy.abort()` already rolls every
    /// dirty-view allocation the reservoir drew from back to free, so
    /// returning them a second time here would double-free.
    pub fn clear(&self) {
        self.pool.lock().blocks.clear();
    }

    /// Number of blocks currently held in the pool (for tests/diagnostics).
    pub fn len(&self) -> usize {
        self.pool.lock().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Reservoir {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::bitmap_alloc::BitmapAllocator;
    use crate::geometry::Geometry;

    fn buddy() -> BuddyAllocator {
        let bm = Arc::new(BitmapAllocator::new(0).unwrap());
        BuddyAllocator::new(Geometry::new(4, 64, 4, 16).unwrap(), bm)
    }

    #[test]
    fn take_refills_on_demand() {
        let b = buddy();
        let r = Reservoir::new();
        assert!(r.is_empty());
        let blk = r.take(&b).unwrap();
        assert!(!b.was_free(blk));
    }

    #[test]
    fn give_back_is_reused_lifo() {
        let b = buddy();
        let r = Reservoir::new();
        let blk = r.take(&b).unwrap();
        r.give_back(blk);
        let blk2 = r.take(&b).unwrap();
        assert_eq!(blk, blk2);
    }
}
