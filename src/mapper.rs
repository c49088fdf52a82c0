// SPDX-License-Identifier: MPL-2.0

//! File block mapper (spec.md §4.D.1–4.D.2): translates a file's logical
//! block numbers to physical ones through CoW-tracked block-map items, and
//! decides when a write can reuse the already-mapped physical block versus
//! needing a fresh copy-on-write allocation.

use std::sync::Arc;

use crate::block::BlockRef;
use crate::buddy::BuddyAllocator;
use crate::geometry::{BlockId, Geometry};
use crate::mapping_store::{MapItem, MapKey, MappingStore};
use crate::os::Mutex;
use crate::prelude::*;
use crate::reservoir::Reservoir;
use crate::tx::TransactionGuard;

/// Maps a file's logical blocks to physical ones via a [`MappingStore`],
/// drawing fresh blocks from a per-volume [`Reservoir`] as needed.
pub struct FileBlockMapper<S, G> {
    store: Arc<S>,
    buddy: Arc<BuddyAllocator>,
    reservoir: Arc<Reservoir>,
    tx: Arc<G>,
    geometry: Geometry,
    /// Physical blocks superseded by a CoW this transaction, freed in a
    /// batch at commit rather than immediately (so a reader mid-transaction
    /// can still see the block they started reading from).
    pending_frees: Mutex<Vec<BlockId>>,
}

impl<S: MappingStore, G: TransactionGuard> FileBlockMapper<S, G> {
    pub fn new(
        store: Arc<S>,
        buddy: Arc<BuddyAllocator>,
        reservoir: Arc<Reservoir>,
        tx: Arc<G>,
        geometry: Geometry,
    ) -> Self {
        Self {
            store,
            buddy,
            reservoir,
            tx,
            geometry,
            pending_frees: Mutex::new(Vec::new()),
        }
    }

    fn key_and_index(&self, inode: u64, logical_block: u64) -> (MapKey, usize) {
        let key = MapKey::bmap(inode, logical_block >> self.geometry.map_shift);
        let index = (logical_block & self.geometry.map_mask()) as usize;
        (key, index)
    }

    /// Returns the physical block mapped to `logical_block`, or `None` if
    /// the file has no block there (a hole).
    pub fn resolve(&self, inode: u64, logical_block: u64) -> Result<Option<BlockId>> {
        let (key, index) = self.key_and_index(inode, logical_block);
        let Some(item) = self.store.get(key)? else {
            return Ok(None);
        };
        let entry = item.entries[index];
        Ok((!entry.is_null()).then_some(entry.blkno))
    }

    /// Returns the lengths of contiguous runs of mapped (non-hole) blocks
    /// starting at `logical_block`, up to `max_blocks`, without allocating
    /// anything — used by readers and by write-path coalescing to batch
    /// I/O across adjacent logical blocks.
    pub fn contig_mapped_blocks(&self, inode: u64, logical_block: u64, max_blocks: u64) -> Result<u64> {
        let mut count = 0u64;
        let mut expect_next: Option<BlockId> = None;
        while count < max_blocks {
            match self.resolve(inode, logical_block + count)? {
                Some(blkno) => {
                    if let Some(expected) = expect_next {
                        if blkno != expected {
                            break;
                        }
                    }
                    expect_next = Some(blkno + 1);
                    count += 1;
                }
                None => break,
            }
        }
        Ok(count)
    }

    /// Returns a physical block writable by the current transaction for
    /// `logical_block`, allocating or copy-on-writing as needed:
    ///
    /// - no existing mapping: draw a fresh block from the reservoir.
    /// - mapping exists, but the mapped block was still free as of the
    ///   last commit (i.e. it was itself allocated earlier in *this*
    ///   transaction): reuse it in place, no new allocation.
    /// - mapping exists and the mapped block was already stable (live as
    ///   of the last commit): draw a fresh block from the reservoir and
    ///   queue the old one to be freed at commit.
    ///
    /// On any failure after the map item is obtained, rolls back whatever
    /// it already did speculatively: a freshly-drawn block goes back to
    /// the reservoir, and a freshly-inserted empty item is deleted. A
    /// store mutation that never ran never gets undone, so the old block
    /// is only queued for a deferred free once that mutation has
    /// succeeded — otherwise a failed `update` could leave the stable
    /// mapping still pointing at a block this call has already marked
    /// for release.
    pub fn map_writable_block(&self, inode: u64, logical_block: u64) -> Result<BlockId> {
        let (key, index) = self.key_and_index(inode, logical_block);
        let existing = self.store.get(key)?;
        let inserted = existing.is_none();
        let mut item = existing.unwrap_or_else(|| MapItem::empty(self.geometry.map_count as usize));
        let old = item.entries[index];

        if !old.is_null() && self.buddy.was_free_in_stable(old.blkno) {
            // Free in stable ⇒ allocated by us this transaction already.
            return Ok(old.blkno);
        }

        let new_blkno = self.reservoir.take(&self.buddy)?;

        item.entries[index] = BlockRef {
            blkno: new_blkno,
            seq: self.tx.current_id(),
        };
        let store_result = if inserted {
            self.store.insert(key, item)
        } else {
            self.store.update(key, item)
        };
        if let Err(e) = store_result {
            self.reservoir.give_back(new_blkno);
            if inserted {
                self.store
                    .remove(key)
                    .expect("rollback of a freshly inserted map item must succeed");
            }
            return Err(e);
        }

        if !old.is_null() {
            self.pending_frees.lock().unwrap().push(old.blkno);
            debug!("[FileBlockMapper] CoW: inode {inode} logical block {logical_block} {} -> {new_blkno}", old.blkno);
        }
        Ok(new_blkno)
    }

    /// Frees every block superseded by a CoW this transaction. Call once,
    /// after the transaction has committed (so in-flight readers that
    /// started before the commit never see a block freed out from under
    /// them).
    pub fn apply_pending_frees(&self) -> Result<()> {
        let frees = std::mem::take(&mut *self.pending_frees.lock().unwrap());
        debug!("[FileBlockMapper] applying {} pending free(s) after commit", frees.len());
        for blkno in frees {
            self.buddy.free(blkno, 0)?;
        }
        Ok(())
    }

    /// Discards queued frees without applying them, for transaction abort:
    /// the superseded blocks are still referenced by the (unrolled-back)
    /// stable mapping, so they must not be freed.
    pub fn discard_pending_frees(&self) {
        self.pending_frees.lock().unwrap().clear();
    }

    /// Removes the mapping for `logical_block`, queuing its physical block
    /// to be freed at commit if one was mapped.
    pub fn unmap(&self, inode: u64, logical_block: u64) -> Result<()> {
        let (key, index) = self.key_and_index(inode, logical_block);
        let Some(mut item) = self.store.get(key)? else {
            return Ok(());
        };
        let old = item.entries[index];
        if old.is_null() {
            return Ok(());
        }
        item.entries[index] = BlockRef::NULL;
        self.pending_frees.lock().unwrap().push(old.blkno);
        self.store.update(key, item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap_alloc::BitmapAllocator;
    use crate::mapping_store::InMemoryMappingStore;
    use crate::tx::SimpleTxBarrier;

    fn mapper() -> FileBlockMapper<InMemoryMappingStore, SimpleTxBarrier> {
        let geometry = Geometry::new(4, 64, 4, 16).unwrap();
        let bm = Arc::new(BitmapAllocator::new(0).unwrap());
        let buddy = Arc::new(BuddyAllocator::new(geometry, bm));
        let store = Arc::new(InMemoryMappingStore::new());
        let reservoir = Arc::new(Reservoir::new());
        let tx = Arc::new(SimpleTxBarrier::new());
        FileBlockMapper::new(store, buddy, reservoir, tx, geometry)
    }

    #[test]
    fn first_write_allocates() {
        let m = mapper();
        assert_eq!(m.resolve(1, 0).unwrap(), None);
        let blk = m.map_writable_block(1, 0).unwrap();
        assert_eq!(m.resolve(1, 0).unwrap(), Some(blk));
    }

    #[test]
    fn rewrite_same_tx_reuses_block() {
        let m = mapper();
        let blk1 = m.map_writable_block(1, 0).unwrap();
        let blk2 = m.map_writable_block(1, 0).unwrap();
        assert_eq!(blk1, blk2);
        assert!(m.pending_frees.lock().unwrap().is_empty());
    }

    #[test]
    fn rewrite_after_commit_cows_and_frees_old() {
        let m = mapper();
        let blk1 = m.map_writable_block(1, 0).unwrap();
        m.buddy.commit();
        m.tx.commit();
        let blk2 = m.map_writable_block(1, 0).unwrap();
        assert_ne!(blk1, blk2);
        m.apply_pending_frees().unwrap();
        m.buddy.commit();
        assert!(m.buddy.was_free_in_stable(blk1));
    }

    /// A `MappingStore` whose `insert`/`update` always fail, used to drive
    /// `map_writable_block`'s rollback path without needing a real I/O
    /// fault injector.
    struct FailingStore(InMemoryMappingStore);

    impl MappingStore for FailingStore {
        fn get(&self, key: MapKey) -> Result<Option<MapItem>> {
            self.0.get(key)
        }
        fn insert(&self, _key: MapKey, _item: MapItem) -> Result<()> {
            return_errno_with_msg!(Io, "forced failure");
        }
        fn update(&self, _key: MapKey, _item: MapItem) -> Result<()> {
            return_errno_with_msg!(Io, "forced failure");
        }
        fn remove(&self, key: MapKey) -> Result<()> {
            self.0.remove(key)
        }
    }

    #[test]
    fn failed_store_mutation_rolls_back_reservoir_draw_and_item() {
        let geometry = Geometry::new(4, 64, 4, 16).unwrap();
        let bm = Arc::new(BitmapAllocator::new(0).unwrap());
        let buddy = Arc::new(BuddyAllocator::new(geometry, bm));
        let store = Arc::new(FailingStore(InMemoryMappingStore::new()));
        let reservoir = Arc::new(Reservoir::new());
        let tx = Arc::new(SimpleTxBarrier::new());
        let m = FileBlockMapper::new(store, buddy, reservoir.clone(), tx, geometry);

        let err = m.map_writable_block(1, 0).unwrap_err();
        assert_eq!(err.errno(), Io);
        // The reservoir refilled to carve out a block for this call; since
        // the store write that would have published it never succeeded,
        // the block must have been handed back rather than leaked.
        assert_eq!(reservoir.len(), 4);
        // No half-written item survives the failed insert.
        assert_eq!(m.resolve(1, 0).unwrap(), None);
    }

    #[test]
    fn contig_run_stops_at_hole() {
        let m = mapper();
        m.map_writable_block(1, 0).unwrap();
        m.map_writable_block(1, 1).unwrap();
        // Block 2 left unmapped.
        m.map_writable_block(1, 3).unwrap();
        let run = m.contig_mapped_blocks(1, 0, 10).unwrap();
        assert_eq!(run, 2);
    }
}
