//! gostir: user-mode memory inspector.
//!
//! Given a process identifier, gostir reconstructs the target's virtual
//! address space subregion by subregion, groups allocations into typed
//! entities (private, mapped file, executable image), overlays on-disk PE
//! section geometry onto image memory, and runs a suspicion engine whose
//! rules flag layouts characteristic of code injection, hollowing, and
//! unbacked execution.
//!
//! ```ignore
//! use gostir::os::windows::WindowsOs;
//! use gostir::process::ProcessSnapshot;
//! use gostir::suspicion::SuspicionEngine;
//!
//! let os = WindowsOs::new();
//! let snapshot = ProcessSnapshot::open(1234, &os)?;
//! let findings = SuspicionEngine::new().inspect_and_filter(&snapshot);
//! for (base, _) in findings.entities() {
//!     println!("suspicious allocation at {base:#x}");
//! }
//! ```
//!
//! All OS access flows through the traits in [`os`]; the scripted
//! [`os::fixture`] backend drives the same code paths in tests.

/// Inspector configuration.
pub mod config;

/// Memory-dump collaborator interface.
pub mod dump;

/// Error taxonomy.
pub mod error;

/// Tracing bootstrap.
pub mod logging;

/// Subregions, entities, statistics.
pub mod memory;

/// OS collaborator traits and backends.
pub mod os;

/// Portable-executable parsing.
pub mod pe;

/// Snapshot construction and selection.
pub mod process;

/// The suspicion rule engine and findings map.
pub mod suspicion;

pub use config::{FilterConfig, InspectorConfig};
pub use error::{GostirError, Result};
pub use memory::{Entity, EntityKind, SnapshotStats, Subregion};
pub use process::{MemorySelection, ProcessSnapshot, SelectOptions};
pub use suspicion::{Suspicion, SuspicionEngine, SuspicionKind, SuspicionMap};
