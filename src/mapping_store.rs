// SPDX-License-Identifier: MPL-2.0

//! The keyed B-tree-like store file block-map items live in.
//!
//! spec.md's file block mapper keys items by `(inode, BMAP_KEY,
//! logical_block >> MAP_SHIFT)`. This crate does not implement the B-tree
//! itself (that's `aster-mlsdisk`'s L4 LSM-tree territory, orthogonal to
//! block allocation); `MappingStore` is the trait the mapper needs from it,
//! with `InMemoryMappingStore` as the reference/test implementation, the
//! same "collaborator contract + in-memory mock" shape `BlockSource` uses.

use crate::block::BlockRef;
use crate::geometry::BlockId;
use crate::os::{BTreeMap, Mutex};
use crate::prelude::*;

/// Distinguishes a block-map item from other item kinds the same keyed
/// store might hold (spec.md's `BMAP_KEY`).
pub const BMAP_KEY: u32 = 1;

/// `(inode, kind, index)`, ordered so that all of one inode's block-map
/// items sort contiguously by logical index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct MapKey {
    pub inode: u64,
    pub kind: u32,
    pub index: u64,
}

impl MapKey {
    pub fn bmap(inode: u64, index: u64) -> Self {
        Self {
            inode,
            kind: BMAP_KEY,
            index,
        }
    }
}

/// A block-map item: `MAP_COUNT` entries, each either a `BlockRef` to an
/// allocated block or [`BlockRef::NULL`] for an unmapped logical block.
#[derive(Clone, Debug)]
pub struct MapItem {
    pub entries: Vec<BlockRef>,
}

impl MapItem {
    pub fn empty(map_count: usize) -> Self {
        Self {
            entries: vec![BlockRef::NULL; map_count],
        }
    }
}

/// Keyed lookup/update/insert/delete over block-map items.
///
/// Deliberately small: just what [`crate::FileBlockMapper`] needs. A real
/// implementation backs this with an ordered, CoW-tracked structure (a
/// B-tree, an LSM tree); `InMemoryMappingStore` is a flat `BTreeMap` for
/// testing that structure's contract in isolation.
pub trait MappingStore: Send + Sync {
    fn get(&self, key: MapKey) -> Result<Option<MapItem>>;

    fn insert(&self, key: MapKey, item: MapItem) -> Result<()>;

    fn update(&self, key: MapKey, item: MapItem) -> Result<()>;

    fn remove(&self, key: MapKey) -> Result<()>;
}

/// A `BTreeMap`-backed `MappingStore`, for tests.
#[derive(Default)]
pub struct InMemoryMappingStore {
    items: Mutex<BTreeMap<MapKey, MapItem>>,
}

impl InMemoryMappingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MappingStore for InMemoryMappingStore {
    fn get(&self, key: MapKey) -> Result<Option<MapItem>> {
        Ok(self.items.lock().unwrap().get(&key).cloned())
    }

    fn insert(&self, key: MapKey, item: MapItem) -> Result<()> {
        self.items.lock().unwrap().insert(key, item);
        Ok(())
    }

    fn update(&self, key: MapKey, item: MapItem) -> Result<()> {
        self.items.lock().unwrap().insert(key, item);
        Ok(())
    }

    fn remove(&self, key: MapKey) -> Result<()> {
        self.items.lock().unwrap().remove(&key);
        Ok(())
    }
}
