//! Shared fixture scenarios for integration tests.
#![allow(dead_code)]

use gostir::os::fixture::{FixtureOs, FixtureOsBuilder, ImageFileBuilder};
use gostir::os::types::{SigningInfo, SigningKind, SigningLevel, PAGE_EXECUTE_READ, PAGE_READONLY};
use gostir::pe::types::{
    IMAGE_SCN_CNT_CODE, IMAGE_SCN_CNT_INITIALIZED_DATA, IMAGE_SCN_MEM_EXECUTE, IMAGE_SCN_MEM_READ,
};

pub const HEAP_BASE: u64 = 0x1000_0000;
pub const IMAGE_BASE: u64 = 0x7000_0000;
pub const IMAGE_DEVICE: &str = r"\Device\HarddiskVolume2\Windows\System32\contoso.dll";
pub const IMAGE_PATH: &str = r"C:\Windows\System32\contoso.dll";

/// A well-formed DLL: `.text` R-X, `.rdata` and `.reloc` read-only.
pub fn well_formed_dll() -> Vec<u8> {
    ImageFileBuilder::new()
        .entry_point(0x1500)
        .section(
            ".text",
            0x1000,
            0x1000,
            vec![0xC3; 0x400],
            IMAGE_SCN_MEM_READ | IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_CNT_CODE,
        )
        .section(
            ".rdata",
            0x2000,
            0x1000,
            vec![0x22; 0x200],
            IMAGE_SCN_MEM_READ | IMAGE_SCN_CNT_INITIALIZED_DATA,
        )
        .section(
            ".reloc",
            0x3000,
            0x1000,
            vec![0x33; 0x100],
            IMAGE_SCN_MEM_READ | IMAGE_SCN_CNT_INITIALIZED_DATA,
        )
        .build()
}

/// The clean-process scenario: one read-only private heap allocation and
/// one signed, loader-listed image. Four subregions, nothing suspicious.
pub fn clean_process() -> FixtureOsBuilder {
    FixtureOs::builder()
        .pid(4242)
        .image_name("contoso_host.exe")
        .private_region(HEAP_BASE, 0x10000, PAGE_READONLY)
        .heap(HEAP_BASE)
        .image_subregion(IMAGE_BASE, IMAGE_BASE, 0x1000, PAGE_READONLY)
        .image_subregion(IMAGE_BASE + 0x1000, IMAGE_BASE, 0x1000, PAGE_EXECUTE_READ)
        .image_subregion(IMAGE_BASE + 0x2000, IMAGE_BASE, 0x2000, PAGE_READONLY)
        .image_backing(IMAGE_BASE, IMAGE_DEVICE)
        .file(IMAGE_PATH, well_formed_dll())
        .signing(
            IMAGE_PATH,
            SigningInfo {
                signed: true,
                kind: SigningKind::Embedded,
                level: SigningLevel::Windows,
            },
        )
        .module(
            "contoso.dll",
            IMAGE_BASE,
            0x4000,
            IMAGE_BASE + 0x1500,
            IMAGE_PATH,
        )
}
