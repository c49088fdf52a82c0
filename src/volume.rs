// SPDX-License-Identifier: MPL-2.0

//! Wires the region classifier, both allocators, the reservoir, the
//! transaction barrier, and the file-block mapper into the single handle a
//! caller mounts. `Volume::format` is this crate's "mkfs": it builds a
//! fresh, empty volume instead of reading one off a device, the same role
//! `SwornDisk::create` plays for the teacher's on-disk format.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::bitmap_alloc::BitmapAllocator;
use crate::block::BlockSource;
use crate::buddy::BuddyAllocator;
use crate::geometry::{BlockId, Geometry, PAIR_BLOCKS};
use crate::mapper::FileBlockMapper;
use crate::mapping_store::MappingStore;
use crate::prelude::*;
use crate::region::RegionClassifier;
use crate::reservoir::Reservoir;
use crate::tx::{SimpleTxBarrier, TransactionGuard};
use crate::write_path::WritePath;

/// A mounted volume: every piece of spec.md §2–§5 wired together.
pub struct Volume<B, S> {
    pub source: Arc<B>,
    pub geometry: Geometry,
    pub classifier: RegionClassifier,
    pub bitmap_alloc: Arc<BitmapAllocator>,
    pub buddy: Arc<BuddyAllocator>,
    pub reservoir: Arc<Reservoir>,
    pub tx: Arc<SimpleTxBarrier>,
    pub mapper: Arc<FileBlockMapper<S, SimpleTxBarrier>>,
    pub write_path: WritePath<B, S, SimpleTxBarrier>,
    /// Which of the `[0, PAIR_BLOCKS)` commit-pair blocks currently holds
    /// the stable super block.
    stable_super_slot: AtomicU32,
}

impl<B: BlockSource, S: MappingStore> Volume<B, S> {
    /// Formats a fresh, empty volume: no buddy-metadata slots activated,
    /// the stable super block pinned at Pair slot 0, no files mapped.
    pub fn format(source: Arc<B>, store: Arc<S>, geometry: Geometry) -> Result<Self> {
        if source.nblocks() <= PAIR_BLOCKS {
            return_errno_with_msg!(Invalid, "device is too small to hold even the commit-pair blocks");
        }
        let bitmap_alloc = Arc::new(BitmapAllocator::new(0)?);
        let buddy = Arc::new(BuddyAllocator::new(geometry, bitmap_alloc.clone()));
        let reservoir = Arc::new(Reservoir::new());
        let tx = Arc::new(SimpleTxBarrier::new());
        let mapper = Arc::new(FileBlockMapper::new(store, buddy.clone(), reservoir.clone(), tx.clone(), geometry));
        let write_path = WritePath::new(source.clone(), mapper.clone(), tx.clone());
        let classifier = RegionClassifier::new(geometry);
        info!("[Volume] formatted, {} device blocks, geometry {:?}", source.nblocks(), geometry);
        Ok(Self {
            source,
            geometry,
            classifier,
            bitmap_alloc,
            buddy,
            reservoir,
            tx,
            mapper,
            write_path,
            stable_super_slot: AtomicU32::new(0),
        })
    }

    /// The commit-pair slot a writer should target for the next super
    /// block update: the side opposite the current stable one.
    pub fn dirty_super_slot(&self) -> BlockId {
        self.classifier
            .pair_alloc_same(self.stable_super_slot.load(Ordering::Acquire) as u64)
            .expect("stable_super_slot is always within the Pair region")
    }

    /// Commits the in-flight transaction: applies every block-map CoW's
    /// deferred free, returns the reservoir's remaining stock to the buddy
    /// allocator, folds the buddy/bitmap allocators' dirty views into their
    /// stable ones, and flips which commit-pair slot is stable. Returns the
    /// new transaction id.
    pub fn commit(&self) -> Result<u64> {
        self.mapper.apply_pending_frees()?;
        self.reservoir.drain(&self.buddy)?;
        self.buddy.commit();
        let id = self.tx.commit();
        self.stable_super_slot.store(self.dirty_super_slot() as u32, Ordering::Release);
        debug!("[Volume] committed transaction {id}");
        Ok(id)
    }

    /// Aborts the in-flight transaction: discards deferred frees and every
    /// allocator's dirty view, leaving the stable super-block slot
    /// untouched. The reservoir's stock was drawn from the dirty view the
    /// buddy allocator is about to roll back, so it's dropped rather than
    /// returned (returning it would double-free against the reverted view).
    pub fn abort(&self) {
        self.mapper.discard_pending_frees();
        self.reservoir.clear();
        self.buddy.abort();
        self.tx.abort();
        warn!("[Volume] transaction aborted");
    }

    pub fn reader_hold(&self) {
        self.tx.reader_hold();
    }

    pub fn reader_release(&self) {
        self.tx.reader_release();
    }
}
