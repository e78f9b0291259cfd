//! Narrow interfaces to the operating system and its oracles.
//!
//! The inspector core never calls the OS directly. Everything it needs is
//! expressed by the traits here: an [`OsApi`] context constructed once and
//! passed to snapshot construction, a per-target [`ProcessAccess`] session
//! the snapshot owns for its lifetime, and a [`SigningOracle`] for backing
//! files. Splitting the seams this way keeps the core testable with the
//! scripted [`fixture`] backend and keeps platform code out of the model.

use std::path::{Path, PathBuf};

use crate::error::OsError;

pub mod fixture;
pub mod types;
#[cfg(windows)]
pub mod windows;

pub use types::{
    ModuleInfo, RegionInfo, SigningInfo, SigningKind, SigningLevel, SystemThread, ThreadInfo,
};

/// Operating-system context for snapshot construction.
///
/// One value serves any number of snapshots; implementations resolve
/// whatever function pointers or tables they need at construction and are
/// immutable afterwards.
pub trait OsApi {
    /// Open the target for read and query access.
    fn open_process(&self, pid: u32) -> Result<Box<dyn ProcessAccess>, OsError>;

    /// Whether the inspector itself runs under the compatibility layer.
    fn inspector_is_compat(&self) -> bool;

    /// The system-wide thread list. A failure here degrades the snapshot
    /// to an empty thread list rather than aborting it.
    fn system_threads(&self) -> Result<Vec<SystemThread>, OsError>;

    /// Query one thread's entry point, TEB, and stack pointer. `process`
    /// grants remote reads for attributes stored in target memory. An
    /// `Err` aborts the snapshot; unknown individual attributes are `None`
    /// fields on the `Ok` value.
    fn query_thread(
        &self,
        tid: u32,
        process: &dyn ProcessAccess,
    ) -> Result<ThreadInfo, OsError>;

    /// Translate a device-prefixed path (`\Device\HarddiskVolume3\...`)
    /// to a canonical filesystem path.
    fn translate_device_path(&self, device_path: &str) -> Option<PathBuf>;

    /// Read the full contents of a backing file. Unreadable files are a
    /// valid outcome (the caller records a phantom image), not a fault.
    fn read_image_file(&self, path: &Path) -> std::io::Result<Vec<u8>>;

    /// The code-signing oracle for backing files.
    fn signing(&self) -> &dyn SigningOracle;
}

/// An open read/query session on one target process.
///
/// Exclusively owned by the snapshot built over it; dropping the session
/// releases the underlying handle.
pub trait ProcessAccess {
    fn pid(&self) -> u32;

    /// Base name of the main module, e.g. `"notepad.exe"`.
    fn base_name(&self) -> Result<String, OsError>;

    /// Device-prefixed path of the main image.
    fn device_image_path(&self) -> Result<String, OsError>;

    /// Whether the target runs under the compatibility layer.
    fn is_compat_layer(&self) -> Result<bool, OsError>;

    /// Remote address of the process-environment block for the given
    /// architecture view, if the OS reports one.
    fn peb_address(&self, compat: bool) -> Option<u64>;

    /// Read `length` bytes of target memory at `address`.
    fn read_memory(&self, address: u64, length: usize) -> Result<Vec<u8>, OsError>;

    /// Query the region containing or following `address`. `None` means
    /// the end of queryable address space.
    fn query_region(&self, address: u64) -> Option<RegionInfo>;

    /// Device-prefixed path of the file mapped at `base`, for mapped and
    /// image allocations.
    fn mapped_file_path(&self, base: u64) -> Option<String>;

    /// The target's loader-recorded module list.
    fn modules(&self) -> Vec<ModuleInfo>;
}

/// Classifies the signature state of an on-disk file.
pub trait SigningOracle {
    /// Oracle failures are folded into an unsigned classification by the
    /// implementation; this call is infallible by contract.
    fn classify(&self, path: &Path) -> SigningInfo;
}
