// SPDX-License-Identifier: MPL-2.0

//! Self-host bitmap allocator (spec.md §4.B): allocates and frees the
//! blocks that store buddy metadata, from a single flat bitmap block pinned
//! at [`crate::geometry::BM_BLKNO`].
//!
//! Grounded in `AllocTable` (`layers/5-disk/block_alloc.rs`): a `BitMap`
//! behind a lock, `first_one` to scan forward for the lowest free bit index.
//! The one addition over `AllocTable` is the stable/dirty split: a slot is
//! only handed out if it is clear in *both* the last-committed view and the
//! in-flight one, which is the core CoW invariant this whole crate enforces
//! (spec.md §1).

use crate::os::Mutex;
use crate::prelude::*;
use crate::util::BitMap;

/// One block's worth of bits: the self-host bitmap is "one block holding
/// `buddy_blocks` bits" (spec.md §3), so its capacity is fixed at
/// `BLOCK_SIZE * 8` regardless of `Geometry`.
pub const CAPACITY: usize = BLOCK_SIZE * 8;

struct State {
    /// Bit `i` set ⇔ slot `i` was free as of the last commit.
    stable: BitMap,
    /// Bit `i` set ⇔ slot `i` is free in the in-flight transaction.
    dirty: BitMap,
}

/// Allocates and frees buddy-metadata slot numbers.
///
/// # Thread safety
///
/// Interior mutability via a single lock; `alloc`/`free` serialize against
/// each other, matching `AllocTable`'s `Mutex<BitMap>`.
pub struct BitmapAllocator {
    state: Mutex<State>,
}

impl BitmapAllocator {
    /// Builds an allocator where slots `[0, buddy_blocks)` are already in
    /// use (as a freshly-formatted volume's first `buddy_blocks` slots
    /// always are) and the rest are free.
    pub fn new(buddy_blocks: u64) -> Result<Self> {
        if buddy_blocks as usize > CAPACITY {
            return_errno_with_msg!(NoSpace, "buddy_blocks exceeds the self-host bitmap's capacity");
        }
        let mut bitmap = BitMap::repeat(true, CAPACITY);
        for slot in 0..buddy_blocks as usize {
            bitmap.clear_bit(slot);
        }
        Ok(Self {
            state: Mutex::new(State {
                stable: bitmap.clone(),
                dirty: bitmap,
            }),
        })
    }

    /// Restores an allocator from an on-disk bitmap image (used by
    /// [`crate::Volume`] on mount). `stable` and `dirty` start identical: no
    /// transaction was in flight when the volume was last unmounted cleanly.
    pub fn from_words(words: Vec<u64>) -> Result<Self> {
        let bitmap = BitMap::from_words(words, CAPACITY);
        Ok(Self {
            state: Mutex::new(State {
                stable: bitmap.clone(),
                dirty: bitmap,
            }),
        })
    }

    /// Allocates the lowest-numbered slot that is free in both the stable
    /// and dirty views, and marks it in-use in the dirty view.
    ///
    /// Does not touch the stable view: the slot only becomes permanently
    /// in-use once [`BitmapAllocator::commit`] runs, so an abort can still
    /// hand it back by discarding the dirty view.
    pub fn alloc(&self) -> Result<u32> {
        let mut state = self.state.lock().unwrap();
        let Some(slot) = Self::find_free(&state) else {
            warn!("[BitmapAllocator] alloc failed: no free slot for buddy metadata");
            return_errno_with_msg!(NoSpace, "self-host bitmap has no free slot");
        };
        state.dirty.clear_bit(slot);
        trace!("[BitmapAllocator] allocated slot {slot}");
        Ok(slot as u32)
    }

    /// Scans forward from bit 0 for the lowest slot free in both views
    /// (spec.md §4.B), matching `buddy.rs`'s own lowest-block-number
    /// tie-break (§4.C.2) rather than rotating a search hint — a slot freed
    /// below wherever the last allocation landed must be visible on the
    /// very next call.
    fn find_free(state: &State) -> Option<usize> {
        let mut at = 0;
        loop {
            let candidate = state.dirty.first_one(at)?;
            if state.stable.test_bit(candidate) {
                return Some(candidate);
            }
            at = candidate + 1;
            if at >= state.dirty.len() {
                return None;
            }
        }
    }

    /// Marks `slot` free again in the dirty view. Valid only for a slot
    /// allocated earlier in the same transaction; freeing a stable slot
    /// before commit would let a concurrent reader observe it as free while
    /// the stable view still claims it's in use.
    pub fn free(&self, slot: u32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if slot as usize >= CAPACITY {
            return_errno_with_msg!(Invalid, "slot out of range");
        }
        state.dirty.set_bit(slot as usize);
        Ok(())
    }

    /// Returns whether `slot` was free as of the last commit and is still
    /// free in the dirty view — i.e. whether it's safe to treat as already
    /// reclaimed without waiting for the next commit (spec.md's `was_free`
    /// reuse rule, generalized to bitmap slots).
    pub fn was_free(&self, slot: u32) -> bool {
        let state = self.state.lock().unwrap();
        if slot as usize >= CAPACITY {
            return false;
        }
        state.stable.test_bit(slot as usize) && state.dirty.test_bit(slot as usize)
    }

    /// Folds the dirty view into the stable one at transaction commit.
    pub fn commit(&self) {
        let mut state = self.state.lock().unwrap();
        state.stable = state.dirty.clone();
    }

    /// Discards the dirty view, rolling back to the last commit.
    pub fn abort(&self) {
        let mut state = self.state.lock().unwrap();
        state.dirty = state.stable.clone();
    }

    /// A snapshot of the dirty view's words, for persisting to the self-host
    /// bitmap's on-disk block.
    pub fn snapshot_words(&self) -> Vec<u64> {
        self.state.lock().unwrap().dirty.as_words().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_avoids_inuse_prefix() {
        let alloc = BitmapAllocator::new(4).unwrap();
        let slot = alloc.alloc().unwrap();
        assert_eq!(slot, 4);
    }

    #[test]
    fn freed_slot_not_visible_until_commit() {
        let alloc = BitmapAllocator::new(0).unwrap();
        let slot = alloc.alloc().unwrap();
        assert!(!alloc.was_free(slot));
        alloc.free(slot).unwrap();
        // Dirty view has it free again, but stable doesn't yet.
        assert!(!alloc.was_free(slot));
        alloc.commit();
        assert!(alloc.was_free(slot));
    }

    #[test]
    fn abort_restores_stable_view() {
        let alloc = BitmapAllocator::new(0).unwrap();
        let slot = alloc.alloc().unwrap();
        alloc.abort();
        let slot2 = alloc.alloc().unwrap();
        assert_eq!(slot, slot2);
    }

    #[test]
    fn exhaustion_is_no_space() {
        let alloc = BitmapAllocator::new(CAPACITY as u64).unwrap();
        assert_eq!(alloc.alloc().unwrap_err().errno(), NoSpace);
    }
}
