//! Property-based invariant tests: allocator bin discipline, hash
//! properties, idempotence, and logical round-trips over random trees.

use hive_writer::hbin::{HbinCellIterator, HbinHeader, HBIN_HEADER_SIZE};
use hive_writer::subkey_list::lh_hash;
use hive_writer::{
    Arena, BuilderConfig, CellAllocator, CellClass, DirtyPages, Hive, HiveBuilder, Session,
    ValueData,
};
use proptest::prelude::*;
use std::collections::HashMap;

const PAGE_SIZE: usize = 0x1000;

/// Walks every bin of a hive image and checks the cell packing invariants:
/// all sizes are positive multiples of 8, cells tile each bin exactly, and
/// no two free cells are adjacent.
fn assert_bin_invariants(data: &[u8]) {
    let mut abs = PAGE_SIZE;
    while abs < data.len() {
        let rel = (abs - PAGE_SIZE) as u32;
        let header = HbinHeader::parse(&data[abs..], rel).expect("bin header");
        let bin_size = header.size as usize;
        assert_eq!(bin_size % PAGE_SIZE, 0, "bin size not page aligned");

        let area = &data[abs + HBIN_HEADER_SIZE..abs + bin_size];
        let mut covered = 0usize;
        let mut prev_free = false;
        for cell in HbinCellIterator::new(area, rel + HBIN_HEADER_SIZE as u32) {
            let cell = cell.expect("cell walk");
            assert!(cell.size >= 8, "undersized cell at {:#x}", cell.offset);
            assert_eq!(cell.size % 8, 0, "misaligned cell at {:#x}", cell.offset);
            if !cell.is_allocated {
                assert!(!prev_free, "adjacent free cells at {:#x}", cell.offset);
            }
            prev_free = !cell.is_allocated;
            covered += cell.size as usize;
        }
        assert_eq!(
            covered,
            bin_size - HBIN_HEADER_SIZE,
            "cells do not tile bin at {:#x}",
            rel
        );
        abs += bin_size;
    }
}

fn scratch_arena(dir: &tempfile::TempDir) -> (Arena, CellAllocator, DirtyPages) {
    use hive_writer::utils::write_i32_le;

    let path = dir.path().join("scratch.hive");
    let mut arena = Arena::create(&path, 2 * PAGE_SIZE).unwrap();
    hive_writer::BaseBlock::new_empty(0xFFFF_FFFF, PAGE_SIZE as u32)
        .serialize(arena.bytes_mut())
        .unwrap();
    HbinHeader::write(
        &mut arena.bytes_mut()[PAGE_SIZE..],
        0,
        PAGE_SIZE as u32,
        hive_writer::utils::filetime_now(),
    )
    .unwrap();
    write_i32_le(
        arena.bytes_mut(),
        PAGE_SIZE + HBIN_HEADER_SIZE,
        (PAGE_SIZE - HBIN_HEADER_SIZE) as i32,
    )
    .unwrap();

    let alloc = CellAllocator::from_arena(&arena).unwrap();
    let dirty = DirtyPages::new(arena.len());
    (arena, alloc, dirty)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_allocator_preserves_bin_invariants(
        sizes in prop::collection::vec(8usize..2048, 1..60),
        free_mask in prop::collection::vec(any::<bool>(), 60),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let (mut arena, mut alloc, mut dirty) = scratch_arena(&dir);

        let mut live = Vec::new();
        for (i, &size) in sizes.iter().enumerate() {
            let cell = alloc.alloc(&mut arena, &mut dirty, size, CellClass::Raw).unwrap();
            live.push(cell);

            // Interleave frees with allocations
            if free_mask[i % free_mask.len()] && live.len() > 1 {
                let victim = live.swap_remove(live.len() / 2);
                alloc.free(&mut arena, &mut dirty, victim).unwrap();
            }
        }
        assert_bin_invariants(arena.bytes());

        // Releasing everything coalesces each bin back to one free cell
        for cell in live {
            alloc.free(&mut arena, &mut dirty, cell).unwrap();
        }
        assert_bin_invariants(arena.bytes());

        let data = arena.bytes();
        let mut abs = PAGE_SIZE;
        while abs < data.len() {
            let header = HbinHeader::parse(&data[abs..], (abs - PAGE_SIZE) as u32).unwrap();
            let area = &data[abs + HBIN_HEADER_SIZE..abs + header.size as usize];
            let cells: Vec<_> = HbinCellIterator::new(area, 0)
                .collect::<hive_writer::Result<Vec<_>>>()
                .unwrap();
            prop_assert_eq!(cells.len(), 1);
            prop_assert!(!cells[0].is_allocated);
            abs += header.size as usize;
        }
    }

    #[test]
    fn prop_lh_hash_is_case_insensitive(name in "[a-zA-Z0-9 _\\-]{0,40}") {
        prop_assert_eq!(lh_hash(&name), lh_hash(&name.to_uppercase()));
        prop_assert_eq!(lh_hash(&name), lh_hash(&name.to_lowercase()));
    }

    #[test]
    fn prop_random_tree_round_trips(
        entries in prop::collection::vec(
            (
                prop::collection::vec("[A-Za-z][A-Za-z0-9]{0,11}", 1..4),
                "[A-Za-z][A-Za-z0-9]{0,11}",
                prop_oneof![
                    "[A-Za-z0-9 ]{0,24}".prop_map(ValueData::String),
                    any::<u32>().prop_map(ValueData::Dword),
                    any::<u32>().prop_map(ValueData::DwordBigEndian),
                    any::<u64>().prop_map(ValueData::Qword),
                    prop::collection::vec(any::<u8>(), 1..200).prop_map(ValueData::Binary),
                    prop::collection::vec("[A-Za-z0-9]{0,8}", 1..5).prop_map(ValueData::MultiString),
                ],
            ),
            1..40,
        ),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("random.hive");

        let mut expected: HashMap<(String, String), ValueData> = HashMap::new();
        let mut builder = HiveBuilder::create(&path).unwrap();
        for (segments, name, value) in &entries {
            let path_str = segments.join("\\");
            builder.set_value(&path_str, name, value.clone()).unwrap();

            // Later writes win, case-insensitively
            let norm = (path_str.to_uppercase(), name.to_uppercase());
            expected.insert(norm, value.clone());
        }
        builder.close().unwrap();

        assert_bin_invariants(&std::fs::read(&path).unwrap());

        let hive = Hive::open(&path).unwrap();
        prop_assert!(hive.base_block().is_consistent());
        for ((path_upper, name_upper), value) in &expected {
            let key = hive.key_by_path(path_upper).unwrap();
            let read = key.value(name_upper).unwrap().data().unwrap();
            prop_assert_eq!(&read, value);
        }
    }

    #[test]
    fn prop_ensure_key_is_idempotent(
        segments in prop::collection::vec("[A-Za-z][A-Za-z0-9]{0,9}", 1..5),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idempotent.hive");
        let joined = segments.join("\\");

        let mut builder = HiveBuilder::create(&path).unwrap();
        builder.ensure_key(&joined).unwrap();
        builder.commit().unwrap();

        let first = tree_shape(&path);

        builder.ensure_key(&joined).unwrap();
        builder.commit().unwrap();
        builder.close().unwrap();

        let second = tree_shape(&path);
        prop_assert_eq!(first, second);
    }
}

/// Collects `(path, subkey_count, value_count)` for every reachable key.
fn tree_shape(path: &std::path::Path) -> Vec<(String, u32, u32)> {
    fn walk(key: &hive_writer::RegistryKey, prefix: &str, out: &mut Vec<(String, u32, u32)>) {
        let here = format!("{}\\{}", prefix, key.name());
        out.push((here.clone(), key.subkey_count(), key.value_count()));
        for child in key.subkeys().unwrap() {
            walk(&child, &here, out);
        }
    }

    let hive = Hive::open(path).unwrap();
    let root = hive.root_key().unwrap();
    let mut out = Vec::new();
    walk(&root, "", &mut out);
    out
}

#[test]
fn test_noop_session_preserves_every_byte() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("noop.hive");

    let mut builder = HiveBuilder::create(&path).unwrap();
    builder.set_string("Software\\App", "V", "payload").unwrap();
    builder.set_binary("Software\\App", "Blob", vec![9u8; 20_000]).unwrap();
    builder.close().unwrap();

    let before = std::fs::read(&path).unwrap();

    let mut session = Session::open(&path).unwrap();
    session.apply_with_tx(Vec::new()).unwrap();
    session.close().unwrap();

    let after = std::fs::read(&path).unwrap();
    assert_eq!(before, after);
}

#[test]
fn test_committed_checksum_matches_xor_of_header_dwords() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checksum.hive");

    let mut builder = HiveBuilder::create(&path).unwrap();
    builder.set_dword("K", "V", 1).unwrap();
    builder.close().unwrap();

    let data = std::fs::read(&path).unwrap();
    let mut expected = 0u32;
    for i in (0..0x1FC).step_by(4) {
        expected ^= u32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
    }
    let stored = u32::from_le_bytes([data[0x1FC], data[0x1FD], data[0x1FE], data[0x1FF]]);
    assert_eq!(stored, expected);
}

#[test]
fn test_counts_consistent_after_mixed_edits() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("counts.hive");

    let config = BuilderConfig {
        deferred_subkeys: true,
        ..BuilderConfig::default()
    };
    let mut builder = HiveBuilder::create_with(&path, config).unwrap();
    for i in 0..50 {
        builder.set_dword(&format!("Parent\\Child{:02}", i), "n", i).unwrap();
    }
    builder.commit().unwrap();
    for i in 0..10 {
        builder.delete_key(&format!("Parent\\Child{:02}", i * 3)).unwrap();
    }
    builder.close().unwrap();

    assert_bin_invariants(&std::fs::read(&path).unwrap());

    let hive = Hive::open(&path).unwrap();
    let parent = hive.key_by_path("Parent").unwrap();
    let children = parent.subkeys().unwrap();
    assert_eq!(parent.subkey_count() as usize, children.len());
    assert_eq!(children.len(), 40);
    for child in &children {
        assert_eq!(child.value_count() as usize, child.values().unwrap().len());
    }
}
