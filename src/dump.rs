//! Memory-dump driving.
//!
//! The writer itself is a collaborator: given a process session and a
//! subregion it produces an output file and reports the path. The core
//! only decides what may be dumped.

use std::path::PathBuf;

use crate::error::{DumpFailure, GostirError, OsError, Result};
use crate::memory::entity::Entity;
use crate::memory::subregion::Subregion;
use crate::os::ProcessAccess;
use crate::process::snapshot::ProcessSnapshot;

/// A sink that materializes one subregion's bytes as a file.
pub trait DumpSink {
    fn create(
        &mut self,
        process: &dyn ProcessAccess,
        subregion: &Subregion,
    ) -> std::result::Result<PathBuf, OsError>;
}

impl ProcessSnapshot {
    /// Dump one committed subregion through the sink.
    ///
    /// Non-committed subregions are refused with a defined error; there
    /// are no bytes to materialize for reserved or freed space.
    pub fn dump_block(&self, sink: &mut dyn DumpSink, subregion: &Subregion) -> Result<PathBuf> {
        if !subregion.is_committed() {
            return Err(GostirError::DumpFailed {
                base: subregion.base_va(),
                reason: DumpFailure::NotCommitted,
            });
        }
        sink.create(self.process(), subregion)
            .map_err(|e| GostirError::DumpFailed {
                base: subregion.base_va(),
                reason: DumpFailure::Sink(e),
            })
    }

    /// Dump every committed subregion of an entity, in address order.
    pub fn dump_entity(&self, sink: &mut dyn DumpSink, entity: &Entity) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for sub in entity.subregions().iter().filter(|s| s.is_committed()) {
            paths.push(self.dump_block(sink, sub)?);
        }
        Ok(paths)
    }
}
