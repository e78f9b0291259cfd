//! Error types for the gostir memory inspector.
//!
//! Errors fall into three tiers: fatal errors abort the snapshot under
//! construction and surface as `GostirError`; degraded states are logged
//! and represented as absent optional fields on the model; per-region and
//! per-thread attribute failures are absorbed locally.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::pe::PeError;

/// A failed operating-system call, named after the failing operation and
/// carrying the underlying status where one was available.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{operation} failed (status {status:#x})")]
pub struct OsError {
    /// The OS operation that failed, e.g. `"OpenProcess"`.
    pub operation: &'static str,
    /// Raw OS status or error code, zero when the backend has none.
    pub status: i64,
}

impl OsError {
    pub fn new(operation: &'static str, status: i64) -> Self {
        Self { operation, status }
    }
}

/// Fatal errors for snapshot construction and dump driving.
#[derive(Debug, Error)]
pub enum GostirError {
    /// The target process could not be opened for read and query access.
    #[error("failed to open process {pid}: {source}")]
    OpenFailed { pid: u32, source: OsError },

    /// A compatibility-layer inspector cannot map a native target.
    #[error("cannot inspect native process {pid} from a compatibility-layer inspector")]
    ArchitectureMismatch { pid: u32 },

    /// One thread of the target could not be queried; the snapshot is
    /// abandoned rather than presented with a hole in thread attribution.
    #[error("thread query failed for tid {tid} in process {pid}: {source}")]
    ThreadQueryFailed { pid: u32, tid: u32, source: OsError },

    /// A backing file was readable but is not a valid portable executable.
    #[error("malformed image {}: {source}", path.display())]
    MalformedImage { path: PathBuf, source: PeError },

    /// A memory dump could not be produced for the given subregion.
    #[error("memory dump failed at {base:#x}: {reason}")]
    DumpFailed { base: u64, reason: DumpFailure },
}

/// Why a dump request was refused or failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DumpFailure {
    /// Only committed memory can be dumped.
    NotCommitted,
    /// The sink reported an error creating or writing the output.
    Sink(OsError),
}

impl fmt::Display for DumpFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotCommitted => write!(f, "subregion is not committed"),
            Self::Sink(e) => write!(f, "sink error: {}", e),
        }
    }
}

/// Result type alias for gostir operations.
pub type Result<T> = std::result::Result<T, GostirError>;
