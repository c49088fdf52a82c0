// SPDX-License-Identifier: MPL-2.0

//! End-to-end scenarios against a full [`Volume`]: a file write, CoW reuse
//! within and across transactions, a multi-block write, capacity exhaustion,
//! and a partial-page overwrite.

use std::sync::Arc;

use cowfs_alloc::{Geometry, InMemoryMappingStore, MemBlockDevice, Volume, BLOCK_SIZE};

fn scenario_volume() -> Volume<MemBlockDevice, InMemoryMappingStore> {
    let _ = env_logger::try_init();
    let geometry = Geometry::PRODUCTION;
    // data_region_start for PRODUCTION is BM_BLKNO + BM_NR + SLOTS = 2 + 1 + 256 = 259;
    // one slot covers ORDER0_BITS=32768 blocks, far more than the 1,024 data
    // blocks these scenarios need, so a couple thousand blocks is plenty.
    let source = Arc::new(MemBlockDevice::new(2048));
    let store = Arc::new(InMemoryMappingStore::new());
    Volume::format(source, store, geometry).unwrap()
}

#[test]
fn scenario_1_write_then_commit_is_visible() {
    let v = scenario_volume();
    v.write_path.write(5, 0, &vec![0xAAu8; BLOCK_SIZE]).unwrap();
    let b0 = v.mapper.resolve(5, 0).unwrap().unwrap();
    v.commit().unwrap();
    assert_eq!(v.mapper.resolve(5, 0).unwrap(), Some(b0));
    assert_eq!(v.mapper.contig_mapped_blocks(5, 0, 10).unwrap(), 1);
}

#[test]
fn scenario_2_rewrite_same_transaction_reuses_block() {
    let v = scenario_volume();
    v.write_path.write(5, 0, &vec![0xAAu8; BLOCK_SIZE]).unwrap();
    let b0 = v.mapper.resolve(5, 0).unwrap().unwrap();
    v.write_path.write(5, 0, &vec![0xBBu8; BLOCK_SIZE]).unwrap();
    let b0_again = v.mapper.resolve(5, 0).unwrap().unwrap();
    assert_eq!(b0, b0_again);
}

#[test]
fn scenario_3_rewrite_new_transaction_cows() {
    let v = scenario_volume();
    v.write_path.write(5, 0, &vec![0xAAu8; BLOCK_SIZE]).unwrap();
    let b0 = v.mapper.resolve(5, 0).unwrap().unwrap();
    v.commit().unwrap();

    v.write_path.write(5, 0, &vec![0xCCu8; BLOCK_SIZE]).unwrap();
    let b1 = v.mapper.resolve(5, 0).unwrap().unwrap();
    assert_ne!(b0, b1);

    v.commit().unwrap();
    assert!(v.buddy.was_free_in_stable(b0));
}

#[test]
fn scenario_4_multi_block_write_is_contiguous() {
    let v = scenario_volume();
    let data = vec![0x11u8; BLOCK_SIZE];
    for lb in 0..16u64 {
        v.write_path.write(5, lb, &data).unwrap();
    }
    v.commit().unwrap();
    let run = v.mapper.contig_mapped_blocks(5, 0, 16).unwrap();
    assert_eq!(run, 16, "all 16 blocks of the 64 KiB write must be logically contiguous");
}

#[test]
fn scenario_5_exhaustion_yields_no_space() {
    // A tiny geometry makes exhaustion reachable without writing thousands
    // of blocks: one slot of 64 order-0 blocks.
    let geometry = Geometry::new(4, 64, 1, 16).unwrap();
    let source = Arc::new(MemBlockDevice::new(256));
    let store = Arc::new(InMemoryMappingStore::new());
    let v = Volume::format(source, store, geometry).unwrap();

    let mut allocated = 0u64;
    loop {
        match v.buddy.alloc(0) {
            Ok(_) => allocated += 1,
            Err(e) => {
                assert_eq!(e.errno(), cowfs_alloc::Errno::NoSpace);
                break;
            }
        }
        assert!(allocated <= 64, "must exhaust a single 64-block slot well before 64 allocations");
    }

    let err = v.buddy.alloc(3).unwrap_err();
    assert_eq!(err.errno(), cowfs_alloc::Errno::NoSpace);
}

#[test]
fn scenario_6_partial_overwrite_cows_and_frees_old() {
    let v = scenario_volume();
    v.write_path.write(5, 0, &vec![0x00u8; BLOCK_SIZE]).unwrap();
    let b0 = v.mapper.resolve(5, 0).unwrap().unwrap();
    v.commit().unwrap();

    v.write_path.write_partial(5, 0, 2000, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]).unwrap();
    let b1 = v.mapper.resolve(5, 0).unwrap().unwrap();
    assert_ne!(b0, b1, "a partial write against a stable block must copy-on-write");

    let mut buf = vec![0u8; BLOCK_SIZE];
    v.write_path.read(5, 0, &mut buf).unwrap();
    assert_eq!(&buf[2000..2010], &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
    assert_eq!(buf[1999], 0);
    assert_eq!(buf[2010], 0);

    v.commit().unwrap();
    assert!(v.buddy.was_free_in_stable(b0));
}
