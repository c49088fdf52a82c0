// SPDX-License-Identifier: MPL-2.0

#![deny(unsafe_code)]

//! Block allocation and file-data mapping core for a copy-on-write,
//! block-based filesystem.
//!
//! A volume keeps two views of block ownership at all times: the *stable*
//! view (as of the last committed transaction) and the *dirty* view (the
//! in-flight transaction). No allocator in this crate ever hands out a block
//! that is in use in either view; see [`region`] for how a block number is
//! routed to the allocator that owns it.

mod bitmap_alloc;
mod block;
mod buddy;
mod error;
mod geometry;
mod mapper;
mod mapping_store;
mod os;
mod prelude;
mod region;
mod reservoir;
mod tx;
mod util;
mod volume;
mod write_path;

pub use self::{
    bitmap_alloc::BitmapAllocator,
    block::{Block, BlockRef, BlockSource, MemBlockDevice},
    buddy::{BuddyAllocator, Order},
    error::{Errno, Error},
    geometry::{BlockId, Geometry, BLOCK_SIZE},
    mapper::FileBlockMapper,
    mapping_store::{InMemoryMappingStore, MapKey, MappingStore},
    region::{Region, RegionClassifier},
    reservoir::Reservoir,
    tx::{SimpleTxBarrier, TransactionGuard},
    volume::Volume,
    write_path::WritePath,
};
