//! Operating-system descriptor types and memory constants.
//!
//! The numeric constants mirror the Win32 values so a live backend can
//! pass query results through unchanged; everything above the `os` module
//! reasons in terms of these descriptors only.

use serde::{Deserialize, Serialize};

// Page protection flags.
pub const PAGE_NOACCESS: u32 = 0x01;
pub const PAGE_READONLY: u32 = 0x02;
pub const PAGE_READWRITE: u32 = 0x04;
pub const PAGE_WRITECOPY: u32 = 0x08;
pub const PAGE_EXECUTE: u32 = 0x10;
pub const PAGE_EXECUTE_READ: u32 = 0x20;
pub const PAGE_EXECUTE_READWRITE: u32 = 0x40;
pub const PAGE_EXECUTE_WRITECOPY: u32 = 0x80;
pub const PAGE_GUARD: u32 = 0x100;
pub const PAGE_NOCACHE: u32 = 0x200;
pub const PAGE_WRITECOMBINE: u32 = 0x400;

// Region states.
pub const MEM_COMMIT: u32 = 0x1000;
pub const MEM_RESERVE: u32 = 0x2000;
pub const MEM_FREE: u32 = 0x10000;

// Region types.
pub const MEM_PRIVATE: u32 = 0x20000;
pub const MEM_MAPPED: u32 = 0x40000;
pub const MEM_IMAGE: u32 = 0x1000000;

/// True when the protection value carries any execute right.
pub fn protect_is_executable(protect: u32) -> bool {
    protect & (PAGE_EXECUTE | PAGE_EXECUTE_READ | PAGE_EXECUTE_READWRITE | PAGE_EXECUTE_WRITECOPY)
        != 0
}

/// True when the protection value carries any write right.
pub fn protect_is_writable(protect: u32) -> bool {
    protect
        & (PAGE_READWRITE | PAGE_WRITECOPY | PAGE_EXECUTE_READWRITE | PAGE_EXECUTE_WRITECOPY)
        != 0
}

/// True when the protection value carries any read right.
pub fn protect_is_readable(protect: u32) -> bool {
    protect
        & (PAGE_READONLY
            | PAGE_READWRITE
            | PAGE_WRITECOPY
            | PAGE_EXECUTE_READ
            | PAGE_EXECUTE_READWRITE
            | PAGE_EXECUTE_WRITECOPY)
        != 0
}

/// One region as reported by the OS query, the raw material for a
/// [`Subregion`](crate::memory::Subregion).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionInfo {
    /// Base address of the queried region.
    pub base_address: u64,
    /// Base of the enclosing allocation; regions sharing this value form
    /// one entity.
    pub allocation_base: u64,
    /// Protection the allocation was created with.
    pub allocation_protect: u32,
    /// Region size in bytes.
    pub region_size: u64,
    /// `MEM_COMMIT`, `MEM_RESERVE` or `MEM_FREE`.
    pub state: u32,
    /// Current protection flags.
    pub protect: u32,
    /// `MEM_PRIVATE`, `MEM_MAPPED`, `MEM_IMAGE`, or zero for free space.
    pub region_type: u32,
    /// Resident bytes not shared with another process, captured from the
    /// working-set query at the time of the region query.
    pub private_size: u64,
}

/// One entry of the system-wide thread list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemThread {
    pub tid: u32,
    pub owner_pid: u32,
}

/// Per-thread attributes. Absent fields are attributes the OS declined to
/// report for an otherwise live thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadInfo {
    pub tid: u32,
    pub entry_point: Option<u64>,
    pub teb: Option<u64>,
    pub stack_pointer: Option<u64>,
}

/// One module as recorded in the target's loader list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub name: String,
    pub base: u64,
    pub size: u64,
    pub entry_point: u64,
    pub path: String,
}

/// Authenticode classification for a backing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningInfo {
    pub signed: bool,
    pub kind: SigningKind,
    pub level: SigningLevel,
}

impl SigningInfo {
    /// The classification used for phantom images and oracle failures.
    pub fn unsigned() -> Self {
        Self {
            signed: false,
            kind: SigningKind::Unsigned,
            level: SigningLevel::Unsigned,
        }
    }
}

/// Where a signature was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SigningKind {
    Unsigned,
    /// Embedded Authenticode signature.
    Embedded,
    /// Signature recorded in a system catalog.
    Catalog,
}

/// Windows signing levels, in ascending order of trust.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SigningLevel {
    Unchecked,
    Unsigned,
    Enterprise,
    Developer,
    Authenticode,
    StoreApp,
    Microsoft,
    Windows,
    WindowsTcb,
}
