// SPDX-License-Identifier: MPL-2.0

//! Block buffers and the `BlockSource` collaborator contract.
//!
//! Modeled on `aster-mlsdisk`'s `Buf`/`BlockSet` (`layers/0-bio`): an owned,
//! block-aligned buffer type, and a trait describing how a volume reads,
//! dirties, and releases physical blocks. This crate is the allocation and
//! mapping core; it never implements `BlockSource` itself against a real
//! device, so callers (a page cache, a block device driver) plug their own
//! implementation in. `MemBlockDevice` is the in-memory reference
//! implementation used by this crate's own tests.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::geometry::{BlockId, BLOCK_SIZE};
use crate::os::Mutex;
use crate::prelude::*;

/// An owned buffer exactly `BLOCK_SIZE` bytes long.
#[derive(Clone)]
pub struct Block(Vec<u8>);

impl Block {
    /// A block filled with zero bytes.
    pub fn zeroed() -> Self {
        Self(vec![0u8; BLOCK_SIZE])
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() != BLOCK_SIZE {
            return_errno_with_msg!(Invalid, "block buffer must be exactly BLOCK_SIZE bytes");
        }
        Ok(Self(bytes))
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

impl Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block").field("len", &self.0.len()).finish()
    }
}

/// A reference to a block together with the sequence number it was last
/// observed at, the unit of indirection every CoW-tracked pointer in this
/// crate uses (super block's `buddy_bm_ref`/`buddy_ind_ref`, an indirect
/// block's slot refs, a buddy block's data refs, a block-map item's entries).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct BlockRef {
    pub blkno: BlockId,
    pub seq: u64,
}

impl BlockRef {
    pub const NULL: BlockRef = BlockRef { blkno: 0, seq: 0 };

    pub fn is_null(&self) -> bool {
        self.blkno == 0 && self.seq == 0
    }
}

/// The read/dirty/put contract this crate's allocators and mapper need from
/// whatever owns the actual block storage (page cache, block device).
///
/// Mirrors `BlockSet` (`read`/`write`) plus the dirty-on-write handle
/// `aster-mlsdisk`'s transaction layer builds on top of it: a stable block
/// is never mutated in place, so `dirty_ref` must allocate a fresh physical
/// block (in the same region as the block it supersedes) the first time a
/// transaction touches it, and return the *same* block on every subsequent
/// call within that transaction.
pub trait BlockSource: Send + Sync {
    /// Reads the block at `blkno`.
    fn read(&self, blkno: BlockId) -> Result<Block>;

    /// Marks the block at `blkno` dirty for the current transaction and
    /// returns a writable copy. Does not change its identity; used for
    /// blocks the caller already knows are safe to mutate in place (e.g. a
    /// block already dirtied earlier in the same transaction).
    fn dirty(&self, blkno: BlockId) -> Result<Block>;

    /// Writes `block` back to `blkno`.
    fn write(&self, blkno: BlockId, block: &Block) -> Result<()>;

    /// Dirty-on-write for a tracked reference: if `*ref_` points at a block
    /// last written in a prior, now-stable transaction, allocates a new
    /// physical block (via the region classifier, same region as the old
    /// one), copies the old contents in, and updates `*ref_` in place before
    /// returning it. If `*ref_` already points at a block dirtied in the
    /// current transaction, returns it unchanged.
    fn dirty_ref(&self, ref_: &mut BlockRef) -> Result<Block>;

    /// Releases the block at `blkno`: frees it through the region
    /// classifier once no reference to it survives the current transaction.
    fn put(&self, blkno: BlockId) -> Result<()>;

    /// Total number of blocks on the device.
    fn nblocks(&self) -> u64;
}

/// An in-memory `BlockSource`, for tests. Every block is considered
/// "already dirty" once written, so `dirty_ref` never reallocates; real
/// stable/dirty CoW semantics are exercised through [`crate::Volume`]
/// instead, which layers its own stable/dirty bookkeeping over a
/// `MemBlockDevice`.
pub struct MemBlockDevice {
    blocks: Mutex<Vec<Block>>,
    next_seq: AtomicU64,
}

impl MemBlockDevice {
    pub fn new(nblocks: u64) -> Self {
        Self {
            blocks: Mutex::new(vec![Block::zeroed(); nblocks as usize]),
            next_seq: AtomicU64::new(1),
        }
    }

    fn check(&self, blkno: BlockId) -> Result<()> {
        if blkno >= self.nblocks() {
            return_errno_with_msg!(Invalid, "blkno out of range");
        }
        Ok(())
    }
}

impl BlockSource for MemBlockDevice {
    fn read(&self, blkno: BlockId) -> Result<Block> {
        self.check(blkno)?;
        Ok(self.blocks.lock().unwrap()[blkno as usize].clone())
    }

    fn dirty(&self, blkno: BlockId) -> Result<Block> {
        self.read(blkno)
    }

    fn write(&self, blkno: BlockId, block: &Block) -> Result<()> {
        self.check(blkno)?;
        self.blocks.lock().unwrap()[blkno as usize] = block.clone();
        Ok(())
    }

    fn dirty_ref(&self, ref_: &mut BlockRef) -> Result<Block> {
        if ref_.seq == 0 {
            ref_.seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        }
        self.read(ref_.blkno)
    }

    fn put(&self, blkno: BlockId) -> Result<()> {
        self.check(blkno)?;
        Ok(())
    }

    fn nblocks(&self) -> u64 {
        self.blocks.lock().unwrap().len() as u64
    }
}
