// SPDX-License-Identifier: MPL-2.0

//! On-disk layout constants (spec.md §6) and the `Geometry` that threads
//! them through every allocator/mapper constructor instead of leaving them
//! as bare global `const`s (see SPEC_FULL.md §0's note on why: tests need a
//! tiny geometry, production wants the real one).

use crate::error::Errno;
use crate::prelude::*;

/// Smallest supported page size; every block is exactly this many bytes.
pub const BLOCK_SIZE: usize = 4096;

/// A device block number.
pub type BlockId = u64;

/// The number of fixed "commit pair" blocks (spec.md §4.A `Pair` region):
/// block 0 holds one side of the dirty/stable super block ping-pong, block 1
/// the other.
pub const PAIR_BLOCKS: BlockId = 2;

/// Fixed device block number of the self-host bitmap's own single storage
/// block (spec.md §2's "single flat bitmap block pinned at a known device
/// offset"). Placed immediately after the two commit-pair blocks.
pub const BM_BLKNO: BlockId = PAIR_BLOCKS;

/// Span, in blocks, of the self-host bitmap's own storage (always `1`: the
/// self-host bitmap is "one block holding `buddy_blocks` bits" per spec.md
/// §3). Kept as a named constant, rather than inlining `1`, because spec.md
/// §6 names `BM_NR` as an on-disk layout constant every implementation must
/// fix identically, and because §4.B's slot formula (`BM_BLKNO + BM_NR + i`)
/// and §3's coverage invariant (`first_blkno = BM_BLKNO + BM_NR +
/// buddy_blocks`) both read literally against this value.
pub const BM_NR: BlockId = 1;

/// Describes the tunable shape of a volume: buddy-block geometry and
/// block-map item geometry. Constructed once at mount time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    /// Number of buddy levels. Order `k` covers `2^k` blocks; the highest
    /// order is `orders - 1`. Must be `<= 8` since `free_orders` is a `u8`
    /// bitmask (spec.md §3).
    pub orders: u32,
    /// Number of order-0 bits per buddy block.
    pub order0_bits: u32,
    /// Number of slots in the indirect block.
    pub slots: u32,
    /// Number of `blkno` entries in a block-map item.
    pub map_count: u32,
    /// `log2(map_count)`; `logical_block >> map_shift` selects the item,
    /// `logical_block & map_mask()` selects the entry within it.
    pub map_shift: u32,
}

impl Geometry {
    /// The geometry used by spec.md §8's end-to-end scenarios:
    /// `ORDERS=5, ORDER0_BITS=32768, SLOTS=256, MAP_COUNT=16`.
    pub const PRODUCTION: Geometry = Geometry {
        orders: 5,
        order0_bits: 32768,
        slots: 256,
        map_count: 16,
        map_shift: 4,
    };

    /// Validates and constructs a `Geometry`.
    ///
    /// `map_count` must be a power of two (so `map_shift`/`map_mask` are
    /// well-defined), `orders` must fit in the `free_orders: u8` bitmask, and
    /// `order0_bits` must be representable by the order-0 sub-bitmap (a
    /// multiple of 64, since `BitMap` is word-granular).
    pub fn new(orders: u32, order0_bits: u32, slots: u32, map_count: u32) -> Result<Self> {
        if orders == 0 || orders > 8 {
            return_errno_with_msg!(Errno::Invalid, "orders must be in 1..=8");
        }
        if order0_bits == 0 || order0_bits % 64 != 0 {
            return_errno_with_msg!(Errno::Invalid, "order0_bits must be a nonzero multiple of 64");
        }
        if order0_bits >> (orders - 1) == 0 {
            return_errno_with_msg!(
                Errno::Invalid,
                "order0_bits too small for the requested number of orders"
            );
        }
        if slots == 0 {
            return_errno_with_msg!(Errno::Invalid, "slots must be nonzero");
        }
        if map_count == 0 || !map_count.is_power_of_two() {
            return_errno_with_msg!(Errno::Invalid, "map_count must be a power of two");
        }
        Ok(Self {
            orders,
            order0_bits,
            slots,
            map_count,
            map_shift: map_count.trailing_zeros(),
        })
    }

    /// `MAP_MASK = MAP_COUNT - 1`.
    pub fn map_mask(&self) -> u64 {
        (self.map_count - 1) as u64
    }

    /// Number of order0-equivalent blocks a single buddy block manages:
    /// `order0_bits`, since each order-0 bit covers exactly one block and
    /// every higher order covers the same total span more coarsely.
    pub fn blocks_per_buddy_block(&self) -> u64 {
        self.order0_bits as u64
    }

    /// Total number of bits across all per-order sub-bitmaps in one buddy
    /// block: `order0_bits + order0_bits/2 + ... ` (`orders` terms).
    pub fn bits_per_buddy_block(&self) -> usize {
        (0..self.orders)
            .map(|k| (self.order0_bits >> k) as usize)
            .sum()
    }

    /// Bit offset within a buddy block's flat bitmap where order `k`'s
    /// sub-bitmap begins.
    pub fn order_bit_offset(&self, order: u32) -> usize {
        (0..order).map(|k| (self.order0_bits >> k) as usize).sum()
    }

    /// Number of bits in order `k`'s sub-bitmap.
    pub fn order_bit_len(&self, order: u32) -> usize {
        (self.order0_bits >> order) as usize
    }

    /// First block number of the dynamically-allocated Buddy region, given
    /// the current count of self-hosted buddy-metadata blocks
    /// (`buddy_blocks`). This is spec.md §3's coverage invariant, verbatim:
    /// `first_blkno = BM_BLKNO + BM_NR + buddy_blocks`.
    pub fn first_blkno(&self, buddy_blocks: u64) -> BlockId {
        BM_BLKNO + BM_NR + buddy_blocks
    }

    /// Physical block number of buddy-metadata slot `slot`, given the
    /// current `buddy_blocks` count (spec.md §4.B: "slot *i* (physical block
    /// at `BM_BLKNO + BM_NR + i`)").
    pub fn slot_blkno(&self, slot: u32) -> BlockId {
        BM_BLKNO + BM_NR + slot as u64
    }

    /// Number of order0-blocks slot `s` manages, clipped to `total_blocks`
    /// (spec.md §3's coverage invariant).
    pub fn slot_coverage(&self, slot: u32, buddy_blocks: u64, total_blocks: u64) -> u64 {
        let first = self.first_blkno(buddy_blocks) + slot as u64 * self.blocks_per_buddy_block();
        if first >= total_blocks {
            return 0;
        }
        let end = (first + self.blocks_per_buddy_block()).min(total_blocks);
        end - first
    }
}
