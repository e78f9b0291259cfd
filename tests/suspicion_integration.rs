//! The rule catalog and the benign filter, end to end.

mod common;

use common::{clean_process, well_formed_dll, IMAGE_BASE};
use gostir::config::{FilterConfig, InspectorConfig};
use gostir::os::fixture::{FixtureOs, ImageFileBuilder};
use gostir::os::types::{
    SigningInfo, SigningKind, SigningLevel, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE,
    PAGE_READONLY,
};
use gostir::pe::types::{IMAGE_SCN_CNT_CODE, IMAGE_SCN_MEM_EXECUTE, IMAGE_SCN_MEM_READ};
use gostir::process::ProcessSnapshot;
use gostir::suspicion::{SuspicionEngine, SuspicionKind, SuspicionMap};

const INJECT_BASE: u64 = 0x3000_0000;
const PHANTOM_BASE: u64 = 0x4000_0000;
const WINMD_BASE: u64 = 0x5000_0000;

#[test]
fn clean_process_yields_empty_map() {
    let os = clean_process().build();
    let snapshot = ProcessSnapshot::open(4242, &os).unwrap();
    let map = SuspicionEngine::new().inspect_and_filter(&snapshot);
    assert!(map.is_empty());
}

#[test]
fn executable_private_region_is_flagged() {
    let os = FixtureOs::builder()
        .private_region(INJECT_BASE, 0x1000, PAGE_EXECUTE_READWRITE)
        .build();
    let snapshot = ProcessSnapshot::open(4242, &os).unwrap();
    let map = SuspicionEngine::new().inspect_and_filter(&snapshot);

    let findings = map.suspicions_at(INJECT_BASE, INJECT_BASE);
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].kind, SuspicionKind::PrivateExec);
    assert!(!findings[0].entity_scope);
}

#[test]
fn executable_mapped_view_is_flagged() {
    let os = FixtureOs::builder()
        .mapped_region(
            0x2200_0000,
            0x2000,
            PAGE_EXECUTE_READ,
            r"\Device\HarddiskVolume2\payload.bin",
        )
        .build();
    let snapshot = ProcessSnapshot::open(4242, &os).unwrap();
    let map = SuspicionEngine::new().inspect_and_filter(&snapshot);

    let findings = map.suspicions_at(0x2200_0000, 0x2200_0000);
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].kind, SuspicionKind::MappedExec);
}

#[test]
fn phantom_image_is_flagged_entity_scope() {
    // Loader-listed and apparently executable, but nothing on disk.
    let os = FixtureOs::builder()
        .image_subregion(PHANTOM_BASE, PHANTOM_BASE, 0x1000, PAGE_READONLY)
        .image_subregion(PHANTOM_BASE + 0x1000, PHANTOM_BASE, 0x1000, PAGE_EXECUTE_READ)
        .image_backing(PHANTOM_BASE, r"\Device\HarddiskVolume2\temp\x.dll")
        .module("x.dll", PHANTOM_BASE, 0x2000, PHANTOM_BASE + 0x1000, r"C:\temp\x.dll")
        .build();
    let snapshot = ProcessSnapshot::open(4242, &os).unwrap();

    let meta = snapshot.entity_at(PHANTOM_BASE).unwrap().image().unwrap();
    assert!(meta.phantom);
    assert!(meta.pe.is_none());
    assert!(!meta.signing.signed);

    let map = SuspicionEngine::new().inspect_and_filter(&snapshot);
    let findings = map.suspicions_at(PHANTOM_BASE, PHANTOM_BASE);
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].kind, SuspicionKind::PhantomImage);
    assert!(findings[0].entity_scope);
}

fn winmd_fixture(signed: bool, entry_point: u32) -> FixtureOs {
    let file = ImageFileBuilder::new()
        .entry_point(entry_point)
        .section(
            ".text",
            0x1000,
            0x1000,
            vec![0x4D; 0x200],
            IMAGE_SCN_MEM_READ | IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_CNT_CODE,
        )
        .build();
    let mut builder = FixtureOs::builder()
        .image_subregion(WINMD_BASE, WINMD_BASE, 0x1000, PAGE_READONLY)
        .image_subregion(WINMD_BASE + 0x1000, WINMD_BASE, 0x1000, PAGE_EXECUTE_READ)
        .image_backing(
            WINMD_BASE,
            r"\Device\HarddiskVolume2\Windows\System32\WinMetadata\Windows.UI.winmd",
        )
        .file(
            r"C:\Windows\System32\WinMetadata\Windows.UI.winmd",
            file,
        );
    if signed {
        builder = builder.signing(
            r"C:\Windows\System32\WinMetadata\Windows.UI.winmd",
            SigningInfo {
                signed: true,
                kind: SigningKind::Catalog,
                level: SigningLevel::Windows,
            },
        );
    }
    builder.build()
}

#[test]
fn signed_winmd_missing_module_is_filtered() {
    let os = winmd_fixture(true, 0);
    let snapshot = ProcessSnapshot::open(4242, &os).unwrap();
    let engine = SuspicionEngine::new();

    let unfiltered = engine.inspect(&snapshot);
    assert!(unfiltered
        .suspicions_at(WINMD_BASE, WINMD_BASE)
        .iter()
        .any(|s| s.kind == SuspicionKind::MissingPebModule));

    let mut map = unfiltered.clone();
    map.filter(&snapshot, &FilterConfig::default());
    assert!(map.is_empty());
}

#[test]
fn unsigned_winmd_missing_module_survives_filter() {
    let os = winmd_fixture(false, 0);
    let snapshot = ProcessSnapshot::open(4242, &os).unwrap();
    let map = SuspicionEngine::new().inspect_and_filter(&snapshot);
    assert!(map
        .suspicions_at(WINMD_BASE, WINMD_BASE)
        .iter()
        .any(|s| s.kind == SuspicionKind::MissingPebModule));
}

#[test]
fn signed_winmd_with_entry_point_survives_filter() {
    let os = winmd_fixture(true, 0x1000);
    let snapshot = ProcessSnapshot::open(4242, &os).unwrap();
    let map = SuspicionEngine::new().inspect_and_filter(&snapshot);
    assert!(map.has_entity(WINMD_BASE));
}

#[test]
fn heap_private_exec_filter_is_opt_in() {
    let build = || {
        FixtureOs::builder()
            .private_region(INJECT_BASE, 0x1000, PAGE_EXECUTE_READWRITE)
            .heap(INJECT_BASE)
            .build()
    };

    // Default posture keeps the finding even on a heap subregion.
    let os = build();
    let snapshot = ProcessSnapshot::open(4242, &os).unwrap();
    let map = SuspicionEngine::new().inspect_and_filter(&snapshot);
    assert_eq!(map.len(), 1);

    // The toggle suppresses it.
    let os = build();
    let snapshot = ProcessSnapshot::open(4242, &os).unwrap();
    let config = InspectorConfig {
        filter: FilterConfig {
            suppress_heap_private_exec: true,
        },
    };
    let map = SuspicionEngine::with_config(config).inspect_and_filter(&snapshot);
    assert!(map.is_empty());
}

#[test]
fn modified_code_is_flagged() {
    // The .text bytes in memory differ from the backing file.
    let os = clean_process()
        .memory(IMAGE_BASE + 0x1000, vec![0x90; 0x400])
        .build();
    let snapshot = ProcessSnapshot::open(4242, &os).unwrap();
    let map = SuspicionEngine::new().inspect_and_filter(&snapshot);

    let findings = map.suspicions_at(IMAGE_BASE, IMAGE_BASE + 0x1000);
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].kind, SuspicionKind::ModifiedCode);
}

#[test]
fn modified_header_is_flagged() {
    let os = clean_process()
        .memory(IMAGE_BASE + 0x40, vec![0xFF; 0x20])
        .build();
    let snapshot = ProcessSnapshot::open(4242, &os).unwrap();
    let map = SuspicionEngine::new().inspect_and_filter(&snapshot);

    let findings = map.suspicions_at(IMAGE_BASE, IMAGE_BASE);
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].kind, SuspicionKind::ModifiedHeader);
}

#[test]
fn reprotected_image_section_is_flagged() {
    // The read-only data pages flipped to RWX: a permission mismatch
    // against the on-disk section characteristics.
    let os = FixtureOs::builder()
        .image_subregion(IMAGE_BASE, IMAGE_BASE, 0x1000, PAGE_READONLY)
        .image_subregion(IMAGE_BASE + 0x1000, IMAGE_BASE, 0x1000, PAGE_EXECUTE_READ)
        .image_subregion(
            IMAGE_BASE + 0x2000,
            IMAGE_BASE,
            0x2000,
            PAGE_EXECUTE_READWRITE,
        )
        .image_backing(IMAGE_BASE, common::IMAGE_DEVICE)
        .file(common::IMAGE_PATH, well_formed_dll())
        .module(
            "contoso.dll",
            IMAGE_BASE,
            0x4000,
            IMAGE_BASE + 0x1500,
            common::IMAGE_PATH,
        )
        .build();
    let snapshot = ProcessSnapshot::open(4242, &os).unwrap();
    let map = SuspicionEngine::new().inspect_and_filter(&snapshot);

    let findings = map.suspicions_at(IMAGE_BASE, IMAGE_BASE + 0x2000);
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].kind, SuspicionKind::DiskPermissionMismatch);
}

#[test]
fn non_executable_image_is_flagged() {
    let file = ImageFileBuilder::new()
        .section(".rsrc", 0x1000, 0x1000, vec![0x55; 0x100], IMAGE_SCN_MEM_READ)
        .build();
    let os = FixtureOs::builder()
        .image_subregion(0x6000_0000, 0x6000_0000, 0x1000, PAGE_READONLY)
        .image_subregion(0x6000_1000, 0x6000_0000, 0x1000, PAGE_READONLY)
        .image_backing(0x6000_0000, r"\Device\HarddiskVolume2\res.dll")
        .file(r"C:\res.dll", file)
        .module("res.dll", 0x6000_0000, 0x2000, 0, r"C:\res.dll")
        .build();
    let snapshot = ProcessSnapshot::open(4242, &os).unwrap();
    let map = SuspicionEngine::new().inspect_and_filter(&snapshot);

    let findings = map.suspicions_at(0x6000_0000, 0x6000_0000);
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].kind, SuspicionKind::NonExecutableImage);
    assert!(findings[0].entity_scope);
}

#[test]
fn filter_is_idempotent() {
    let os = winmd_fixture(true, 0);
    let snapshot = ProcessSnapshot::open(4242, &os).unwrap();
    let mut map = SuspicionEngine::new().inspect(&snapshot);

    map.filter(&snapshot, &FilterConfig::default());
    let once = map.clone();
    map.filter(&snapshot, &FilterConfig::default());
    assert_eq!(map, once);
}

#[test]
fn map_has_no_empty_entries() {
    let os = clean_process()
        .private_region(INJECT_BASE, 0x1000, PAGE_EXECUTE_READWRITE)
        .build();
    let snapshot = ProcessSnapshot::open(4242, &os).unwrap();
    let mut map = SuspicionEngine::new().inspect(&snapshot);
    map.filter(&snapshot, &FilterConfig::default());

    for (_, subregions) in map.entities() {
        assert!(!subregions.is_empty());
        for list in subregions.values() {
            assert!(!list.is_empty());
        }
    }
}

#[test]
fn map_survives_json_round_trip() {
    let os = clean_process()
        .private_region(INJECT_BASE, 0x1000, PAGE_EXECUTE_READWRITE)
        .memory(IMAGE_BASE + 0x1000, vec![0x90; 0x400])
        .build();
    let snapshot = ProcessSnapshot::open(4242, &os).unwrap();
    let map = SuspicionEngine::new().inspect_and_filter(&snapshot);
    assert!(!map.is_empty());

    let json = serde_json::to_string(&map).unwrap();
    let back: SuspicionMap = serde_json::from_str(&json).unwrap();
    assert_eq!(map, back);

    let original: Vec<u64> = map.entities().map(|(b, _)| b).collect();
    let decoded: Vec<u64> = back.entities().map(|(b, _)| b).collect();
    assert_eq!(original, decoded);
}
