// SPDX-License-Identifier: MPL-2.0

//! Write path adapter (spec.md §4.E): the page-cache-facing glue between a
//! file's logical blocks and the physical ones the mapper and block source
//! track.
//!
//! Grounded in `mlsdisk.rs`'s `handle_read_bio`/`handle_write_bio` closure
//! pair: reads fill a buffer either from the mapped physical block or with
//! zeros for a hole, and a partial-block write reads the existing content
//! first so the untouched bytes survive. The "unmapped-dirty" contract is
//! this crate's own addition: a buffer the caller marks dirty without ever
//! having gone through [`WritePath::write`] is a caller bug, not a
//! recoverable I/O condition, so it surfaces as [`Errno::IoCorrupt`] instead
//! of silently allocating on the adapter's behalf.
//!
//! A write holds the reader side of the commit barrier (spec.md §4.E steps
//! 3 and 6) for exactly the span during which it touches the mapper and the
//! block source, and gets its actual block content through
//! `BlockSource::dirty`/`dirty_ref`/`put` rather than a bare `write` call.

use std::sync::Arc;

use crate::block::{BlockRef, BlockSource};
use crate::geometry::BLOCK_SIZE;
use crate::mapper::FileBlockMapper;
use crate::mapping_store::MappingStore;
use crate::prelude::*;
use crate::tx::TransactionGuard;

pub struct WritePath<B, S, G> {
    source: Arc<B>,
    mapper: Arc<FileBlockMapper<S, G>>,
    tx: Arc<G>,
}

impl<B: BlockSource, S: MappingStore, G: TransactionGuard> WritePath<B, S, G> {
    pub fn new(source: Arc<B>, mapper: Arc<FileBlockMapper<S, G>>, tx: Arc<G>) -> Self {
        Self { source, mapper, tx }
    }

    /// Reads the full content of logical block `logical_block` of `inode`
    /// into `buf` (must be exactly `BLOCK_SIZE` bytes). A hole reads as
    /// zeros, matching a sparse file's unwritten-block semantics.
    pub fn read(&self, inode: u64, logical_block: u64, buf: &mut [u8]) -> Result<()> {
        if buf.len() != BLOCK_SIZE {
            return_errno_with_msg!(Invalid, "read buffer must be exactly BLOCK_SIZE bytes");
        }
        match self.mapper.resolve(inode, logical_block)? {
            Some(blkno) => {
                let block = self.source.read(blkno)?;
                buf.copy_from_slice(block.as_slice());
            }
            None => buf.fill(0),
        }
        Ok(())
    }

    /// Writes a full block: `data` must be exactly `BLOCK_SIZE` bytes. No
    /// read-before-write needed since every byte is being replaced.
    ///
    /// Steps 3 and 6 of spec.md §4.E: acquires the reader side of the
    /// commit barrier before touching the mapper, and releases it once the
    /// I/O has completed (including on the error path), so a concurrent
    /// `commit` can never observe this write half-applied.
    pub fn write(&self, inode: u64, logical_block: u64, data: &[u8]) -> Result<()> {
        if data.len() != BLOCK_SIZE {
            return_errno_with_msg!(Invalid, "full-block write must be exactly BLOCK_SIZE bytes");
        }
        self.tx.reader_hold();
        let result = self.write_mapped(inode, logical_block, data);
        self.tx.reader_release();
        result
    }

    fn write_mapped(&self, inode: u64, logical_block: u64, data: &[u8]) -> Result<()> {
        let was_mapped = self.mapper.resolve(inode, logical_block)?.is_some();
        let blkno = self.mapper.map_writable_block(inode, logical_block)?;
        // A block that already had a mapping going in may have been dirtied
        // earlier this same transaction; route it through `dirty_ref` so a
        // real `BlockSource` gets the chance to recognize that and skip a
        // redundant relocation. A block minted fresh this call has no prior
        // content worth preserving, so `dirty` (a plain writable buffer) is
        // all it needs.
        let mut block = if was_mapped {
            let mut block_ref = BlockRef {
                blkno,
                seq: self.tx.current_id(),
            };
            self.source.dirty_ref(&mut block_ref)?
        } else {
            self.source.dirty(blkno)?
        };
        block.as_mut_slice().copy_from_slice(data);
        self.source.write(blkno, &block)?;
        self.source.put(blkno)
    }

    /// Writes `data` at byte `offset` within logical block `logical_block`
    /// (`offset + data.len() <= BLOCK_SIZE`). Reads the existing block
    /// first — from its mapped physical block, or zeros for a hole — so
    /// bytes outside `[offset, offset+data.len())` are preserved. The read
    /// happens before the transaction barrier is acquired (spec.md §4.E
    /// step 2 precedes step 3); [`WritePath::write`] acquires it for the
    /// actual mapping and I/O.
    pub fn write_partial(&self, inode: u64, logical_block: u64, offset: usize, data: &[u8]) -> Result<()> {
        if offset + data.len() > BLOCK_SIZE {
            return_errno_with_msg!(Invalid, "partial write would overflow the block");
        }
        let mut buf = vec![0u8; BLOCK_SIZE];
        self.read(inode, logical_block, &mut buf)?;
        buf[offset..offset + data.len()].copy_from_slice(data);
        self.write(inode, logical_block, &buf)
    }

    /// Clears any buffer this write path may have cached for `logical_block`
    /// of `inode` — called when a block is about to be unmapped or
    /// remapped out from under an existing buffer, so a stale cached
    /// mapping is never read back. This adapter does not itself cache
    /// buffers (that's the page cache's job, upstream of this crate); the
    /// method exists so callers that *do* cache have a single place to hook
    /// invalidation into the mapper's own CoW bookkeeping.
    pub fn invalidate(&self, inode: u64, logical_block: u64) -> Result<()> {
        self.mapper.unmap(inode, logical_block)
    }

    /// Enforces the unmapped-dirty contract: a caller must never mark a
    /// buffer dirty for `logical_block` without having first routed the
    /// write through [`WritePath::write`]/[`WritePath::write_partial`] (which
    /// map the block as a side effect). If no mapping exists here, that
    /// contract was violated upstream.
    pub fn require_mapped(&self, inode: u64, logical_block: u64) -> Result<()> {
        match self.mapper.resolve(inode, logical_block)? {
            Some(_) => Ok(()),
            None => {
                error!("[WritePath] dirty buffer for inode {inode} logical block {logical_block} has no mapping");
                return_errno_with_msg!(
                    IoCorrupt,
                    "buffer marked dirty for a logical block with no physical mapping"
                )
            }
        }
    }
}
