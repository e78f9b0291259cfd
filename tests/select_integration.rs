//! Selection queries and dump driving.

mod common;

use std::path::PathBuf;

use common::{clean_process, HEAP_BASE, IMAGE_BASE};
use gostir::dump::DumpSink;
use gostir::error::OsError;
use gostir::memory::Subregion;
use gostir::os::types::{
    RegionInfo, MEM_PRIVATE, MEM_RESERVE, PAGE_EXECUTE_READWRITE, PAGE_READWRITE,
};
use gostir::os::ProcessAccess;
use gostir::process::{MemorySelection, ProcessSnapshot, SelectOptions};
use gostir::suspicion::SuspicionEngine;
use gostir::GostirError;

const INJECT_BASE: u64 = 0x3000_0000;

#[test]
fn select_all_returns_every_subregion() {
    let os = clean_process().build();
    let snapshot = ProcessSnapshot::open(4242, &os).unwrap();
    let selected = snapshot.select(MemorySelection::All, SelectOptions::default(), None);
    assert_eq!(selected.len(), 4);
    // Ascending address order across entities.
    let bases: Vec<u64> = selected.iter().map(|s| s.base_va()).collect();
    let mut sorted = bases.clone();
    sorted.sort_unstable();
    assert_eq!(bases, sorted);
}

#[test]
fn select_block_matches_one_subregion() {
    let os = clean_process().build();
    let snapshot = ProcessSnapshot::open(4242, &os).unwrap();

    let selected = snapshot.select(
        MemorySelection::Block(IMAGE_BASE + 0x1000),
        SelectOptions::default(),
        None,
    );
    assert_eq!(selected.len(), 1);
    assert_eq!(selected[0].base_va(), IMAGE_BASE + 0x1000);

    // An address inside a subregion but not at its base selects nothing
    // without the from-base expansion.
    let selected = snapshot.select(
        MemorySelection::Block(IMAGE_BASE + 0x1800),
        SelectOptions::default(),
        None,
    );
    assert!(selected.is_empty());
}

#[test]
fn select_block_from_base_expands_to_entity() {
    let os = clean_process().build();
    let snapshot = ProcessSnapshot::open(4242, &os).unwrap();
    let selected = snapshot.select(
        MemorySelection::Block(IMAGE_BASE + 0x1800),
        SelectOptions { from_base: true },
        None,
    );
    assert_eq!(selected.len(), 3);
    assert!(selected.iter().all(|s| s.alloc_base() == IMAGE_BASE));
}

#[test]
fn select_suspicious_returns_flagged_subregions() {
    let os = clean_process()
        .region(RegionInfo {
            base_address: INJECT_BASE,
            allocation_base: INJECT_BASE,
            allocation_protect: PAGE_EXECUTE_READWRITE,
            region_size: 0x1000,
            state: gostir::os::types::MEM_COMMIT,
            protect: PAGE_EXECUTE_READWRITE,
            region_type: MEM_PRIVATE,
            private_size: 0x1000,
        })
        .region(RegionInfo {
            base_address: INJECT_BASE + 0x1000,
            allocation_base: INJECT_BASE,
            allocation_protect: PAGE_EXECUTE_READWRITE,
            region_size: 0x1000,
            state: gostir::os::types::MEM_COMMIT,
            protect: PAGE_READWRITE,
            region_type: MEM_PRIVATE,
            private_size: 0x1000,
        })
        .build();
    let snapshot = ProcessSnapshot::open(4242, &os).unwrap();
    let map = SuspicionEngine::new().inspect_and_filter(&snapshot);

    let selected = snapshot.select(
        MemorySelection::Suspicious,
        SelectOptions::default(),
        Some(&map),
    );
    assert_eq!(selected.len(), 1);
    assert_eq!(selected[0].base_va(), INJECT_BASE);

    let selected = snapshot.select(
        MemorySelection::Suspicious,
        SelectOptions { from_base: true },
        Some(&map),
    );
    assert_eq!(selected.len(), 2);
    assert!(selected.iter().all(|s| s.alloc_base() == INJECT_BASE));
}

#[test]
fn select_suspicious_without_map_selects_nothing() {
    let os = clean_process().build();
    let snapshot = ProcessSnapshot::open(4242, &os).unwrap();
    let selected = snapshot.select(MemorySelection::Suspicious, SelectOptions::default(), None);
    assert!(selected.is_empty());
}

#[test]
fn select_suspicious_entity_scope_needs_from_base() {
    // A phantom image carries only an entity-scope finding; its
    // subregions surface only under the from-base expansion.
    let os = gostir::os::fixture::FixtureOs::builder()
        .image_subregion(0x4000_0000, 0x4000_0000, 0x1000, gostir::os::types::PAGE_READONLY)
        .image_backing(0x4000_0000, r"\Device\HarddiskVolume2\temp\x.dll")
        .module("x.dll", 0x4000_0000, 0x1000, 0, r"C:\temp\x.dll")
        .build();
    let snapshot = ProcessSnapshot::open(4242, &os).unwrap();
    let map = SuspicionEngine::new().inspect_and_filter(&snapshot);
    assert!(map.has_entity(0x4000_0000));

    let narrow = snapshot.select(
        MemorySelection::Suspicious,
        SelectOptions::default(),
        Some(&map),
    );
    assert!(narrow.is_empty());

    let expanded = snapshot.select(
        MemorySelection::Suspicious,
        SelectOptions { from_base: true },
        Some(&map),
    );
    assert_eq!(expanded.len(), 1);
}

#[derive(Default)]
struct RecordingSink {
    created: Vec<(u64, u64)>,
}

impl DumpSink for RecordingSink {
    fn create(
        &mut self,
        _process: &dyn ProcessAccess,
        subregion: &Subregion,
    ) -> Result<PathBuf, OsError> {
        self.created.push((subregion.base_va(), subregion.size()));
        Ok(PathBuf::from(format!(
            "pid_4242_{:016x}.bin",
            subregion.base_va()
        )))
    }
}

#[test]
fn dump_block_refuses_non_committed() {
    let os = clean_process()
        .region(RegionInfo {
            base_address: 0x8000_0000,
            allocation_base: 0x8000_0000,
            allocation_protect: PAGE_READWRITE,
            region_size: 0x1000,
            state: MEM_RESERVE,
            protect: 0,
            region_type: MEM_PRIVATE,
            private_size: 0,
        })
        .build();
    let snapshot = ProcessSnapshot::open(4242, &os).unwrap();
    let mut sink = RecordingSink::default();

    let reserved = snapshot
        .entity_at(0x8000_0000)
        .unwrap()
        .subregion_at(0x8000_0000)
        .unwrap();
    match snapshot.dump_block(&mut sink, reserved) {
        Err(GostirError::DumpFailed { base, .. }) => assert_eq!(base, 0x8000_0000),
        other => panic!("expected DumpFailed, got {other:?}"),
    }
    assert!(sink.created.is_empty());

    let committed = snapshot
        .entity_at(HEAP_BASE)
        .unwrap()
        .subregion_at(HEAP_BASE)
        .unwrap();
    let path = snapshot.dump_block(&mut sink, committed).unwrap();
    assert!(path.to_string_lossy().contains("pid_4242"));
    assert_eq!(sink.created, vec![(HEAP_BASE, 0x10000)]);
}

#[test]
fn dump_entity_covers_committed_subregions() {
    let os = clean_process().build();
    let snapshot = ProcessSnapshot::open(4242, &os).unwrap();
    let mut sink = RecordingSink::default();

    let image = snapshot.entity_at(IMAGE_BASE).unwrap();
    let paths = snapshot.dump_entity(&mut sink, image).unwrap();
    assert_eq!(paths.len(), 3);
    assert_eq!(sink.created.len(), 3);
    assert!(sink.created.iter().all(|(base, _)| *base >= IMAGE_BASE));
}
