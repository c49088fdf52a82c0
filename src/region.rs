// SPDX-License-Identifier: MPL-2.0

//! Region classifier: routes a device block number to the allocator that
//! owns it (spec.md §4.A).
//!
//! Grounded in the dispatch `aster-mlsdisk`'s disk layer does between its
//! super-block pair, `AllocTable` bitmap, and log regions (`mlsdisk.rs`),
//! generalized here into the three-way `Pair`/`Bitmap`/`Buddy` split this
//! spec's volume uses.

use crate::geometry::{BlockId, Geometry, BM_BLKNO, BM_NR, PAIR_BLOCKS};
use crate::prelude::*;

/// Which of the three regions a block number falls in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Region {
    /// One of the two fixed commit-pair blocks: either side of the
    /// dirty/stable super-block ping-pong. Allocation here is not a search;
    /// it's `existing XOR 1`. Freeing a pair slot is a no-op — the other
    /// side is always the free one by construction.
    Pair,
    /// A buddy-metadata block (the indirect block or one of the buddy
    /// blocks), self-hosted by the flat bitmap allocator.
    Bitmap,
    /// Ordinary file-data or B-tree-node storage, managed by the buddy
    /// allocator.
    Buddy,
}

/// Classifies device block numbers against the current volume geometry and
/// the current count of self-hosted buddy-metadata blocks.
///
/// `buddy_blocks` is not fixed at mkfs time: as a volume grows, the
/// self-host bitmap allocator carves more metadata blocks out of what would
/// otherwise be Buddy-region space, so every classification needs the
/// caller's current `buddy_blocks`/`total_blocks`, not just a `Geometry`.
#[derive(Clone, Copy, Debug)]
pub struct RegionClassifier {
    geometry: Geometry,
}

impl RegionClassifier {
    pub fn new(geometry: Geometry) -> Self {
        Self { geometry }
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Classifies `blkno` given the current `buddy_blocks` count.
    ///
    /// # Panics
    ///
    /// Panics if `blkno` is not covered by any region, i.e. `blkno >=
    /// first_blkno(buddy_blocks) + (room left for the Buddy region)` is the
    /// caller's responsibility to avoid — this classifier never needs an
    /// upper bound on the Buddy region, since anything at or past
    /// `first_blkno` is Buddy by definition.
    pub fn classify(&self, blkno: BlockId, buddy_blocks: u64) -> Region {
        let first_blkno = self.geometry.first_blkno(buddy_blocks);
        if blkno < PAIR_BLOCKS {
            Region::Pair
        } else if blkno < first_blkno {
            debug_assert!(blkno >= BM_BLKNO, "block {blkno} falls in the reserved gap before BM_BLKNO");
            Region::Bitmap
        } else {
            Region::Buddy
        }
    }

    /// For a block in the `Pair` region, the other side of the ping-pong:
    /// `existing XOR 1`.
    pub fn pair_alloc_same(&self, existing: BlockId) -> Result<BlockId> {
        if existing >= PAIR_BLOCKS {
            return_errno_with_msg!(Invalid, "blkno is not in the Pair region");
        }
        Ok(existing ^ 1)
    }

    /// First block number of the dynamically-allocated Buddy region for the
    /// given `buddy_blocks` count.
    pub fn first_blkno(&self, buddy_blocks: u64) -> BlockId {
        self.geometry.first_blkno(buddy_blocks)
    }

    /// Range of physical blocks the self-host bitmap currently manages:
    /// `[BM_BLKNO + BM_NR, first_blkno)`.
    pub fn bitmap_region(&self, buddy_blocks: u64) -> std::ops::Range<BlockId> {
        (BM_BLKNO + BM_NR)..self.first_blkno(buddy_blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> RegionClassifier {
        RegionClassifier::new(Geometry::PRODUCTION)
    }

    #[test]
    fn pair_blocks() {
        let c = classifier();
        assert_eq!(c.classify(0, 4), Region::Pair);
        assert_eq!(c.classify(1, 4), Region::Pair);
        assert_eq!(c.pair_alloc_same(0).unwrap(), 1);
        assert_eq!(c.pair_alloc_same(1).unwrap(), 0);
    }

    #[test]
    fn bitmap_and_buddy_blocks() {
        let c = classifier();
        let buddy_blocks = 4;
        let first = c.first_blkno(buddy_blocks);
        assert_eq!(first, BM_BLKNO + BM_NR + buddy_blocks);
        assert_eq!(c.classify(BM_BLKNO, buddy_blocks), Region::Bitmap);
        assert_eq!(c.classify(first - 1, buddy_blocks), Region::Bitmap);
        assert_eq!(c.classify(first, buddy_blocks), Region::Buddy);
    }

    #[test]
    fn buddy_region_grows_with_buddy_blocks() {
        let c = classifier();
        let blkno = c.first_blkno(4);
        assert_eq!(c.classify(blkno, 4), Region::Buddy);
        // The same physical block can become Bitmap-region metadata once
        // the self-host bitmap allocator grows to cover it.
        assert_eq!(c.classify(blkno, 8), Region::Bitmap);
    }
}
