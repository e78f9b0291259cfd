//! The inspection pass: every rule, applied to every entity.

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::InspectorConfig;
use crate::memory::entity::{Entity, EntityKind, ImageMeta};
use crate::memory::subregion::Subregion;
use crate::os::types::{protect_is_executable, protect_is_readable, protect_is_writable};
use crate::pe::SectionHeader;
use crate::process::snapshot::ProcessSnapshot;
use crate::suspicion::{Suspicion, SuspicionKind, SuspicionMap};

// Ceiling on a single memory/disk comparison; larger spans are judged by
// their leading bytes.
const MAX_COMPARE_BYTES: usize = 32 * 1024 * 1024;

/// Evaluates the rule catalog over a snapshot.
#[derive(Debug, Default)]
pub struct SuspicionEngine {
    config: InspectorConfig,
}

impl SuspicionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: InspectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &InspectorConfig {
        &self.config
    }

    /// Run every rule over every entity and collect the findings.
    pub fn inspect(&self, snapshot: &ProcessSnapshot) -> SuspicionMap {
        let mut map = SuspicionMap::new();
        for entity in snapshot.entities() {
            self.inspect_entity(snapshot, entity, &mut map);
        }
        debug!(findings = map.len(), "inspection pass complete");
        map
    }

    /// Run the inspection pass and then the benign filter.
    pub fn inspect_and_filter(&self, snapshot: &ProcessSnapshot) -> SuspicionMap {
        let mut map = self.inspect(snapshot);
        map.filter(snapshot, &self.config.filter);
        map
    }

    fn inspect_entity(&self, snapshot: &ProcessSnapshot, entity: &Entity, map: &mut SuspicionMap) {
        match entity.kind() {
            EntityKind::Private => {
                self.check_executable_subregions(entity, SuspicionKind::PrivateExec, map);
            }
            EntityKind::MappedFile { .. } => {
                self.check_executable_subregions(entity, SuspicionKind::MappedExec, map);
            }
            EntityKind::Image(meta) => {
                self.inspect_image(snapshot, entity, meta, map);
            }
        }
    }

    /// XPRV / XMAP: executable protection where no code should live.
    fn check_executable_subregions(
        &self,
        entity: &Entity,
        kind: SuspicionKind,
        map: &mut SuspicionMap,
    ) {
        for sub in entity.subregions() {
            if sub.is_committed() && sub.is_executable() {
                map.push(Suspicion::subregion_scoped(
                    kind,
                    entity.start_va(),
                    sub.base_va(),
                ));
            }
        }
    }

    fn inspect_image(
        &self,
        snapshot: &ProcessSnapshot,
        entity: &Entity,
        meta: &ImageMeta,
        map: &mut SuspicionMap,
    ) {
        if meta.phantom {
            map.push(Suspicion::entity_scoped(
                SuspicionKind::PhantomImage,
                entity.start_va(),
            ));
        }
        if meta.peb_module.is_none() {
            map.push(Suspicion::entity_scoped(
                SuspicionKind::MissingPebModule,
                entity.start_va(),
            ));
        }
        if meta.non_executable {
            map.push(Suspicion::entity_scoped(
                SuspicionKind::NonExecutableImage,
                entity.start_va(),
            ));
        }

        let Some(image) = meta.pe.as_ref() else {
            return;
        };

        for sub in entity.subregions() {
            if !sub.is_committed() {
                continue;
            }
            let overlaps = image.overlapping_sections(entity.start_va(), sub);

            self.check_permission_mismatch(entity, sub, &overlaps, map);

            if sub.base_va() == entity.start_va()
                && self.header_diverges(snapshot, sub, image.header_bytes())
            {
                map.push(Suspicion::subregion_scoped(
                    SuspicionKind::ModifiedHeader,
                    entity.start_va(),
                    sub.base_va(),
                ));
            }

            for section in overlaps.iter().copied().filter(|s| s.is_executable()) {
                if self.section_diverges(snapshot, entity.start_va(), sub, section, image) {
                    map.push(Suspicion::subregion_scoped(
                        SuspicionKind::ModifiedCode,
                        entity.start_va(),
                        sub.base_va(),
                    ));
                    break;
                }
            }
        }
    }

    /// DISK_PERMISSION_MISMATCH: the loader grants sections the
    /// protection their characteristics declare (modulo copy-on-write),
    /// and header pages are read-only. Anything else was reprotected.
    fn check_permission_mismatch(
        &self,
        entity: &Entity,
        sub: &Subregion,
        overlaps: &[&SectionHeader],
        map: &mut SuspicionMap,
    ) {
        let actual = protect_projection(sub.protect());
        let consistent = if overlaps.is_empty() {
            if sub.base_va() == entity.start_va() {
                actual == (true, false, false)
            } else {
                // Loader padding between sections carries no expectation.
                true
            }
        } else {
            overlaps
                .iter()
                .any(|s| protect_projection(s.implied_protect()) == actual)
        };

        if !consistent {
            map.push(Suspicion::subregion_scoped(
                SuspicionKind::DiskPermissionMismatch,
                entity.start_va(),
                sub.base_va(),
            ));
        }
    }

    /// MODIFIED_HEADER: in-memory header page vs the on-disk header.
    fn header_diverges(
        &self,
        snapshot: &ProcessSnapshot,
        sub: &Subregion,
        disk_header: &[u8],
    ) -> bool {
        let len = disk_header
            .len()
            .min(sub.size() as usize)
            .min(MAX_COMPARE_BYTES);
        if len == 0 {
            return false;
        }
        match snapshot.process().read_memory(sub.base_va(), len) {
            // A short read leaves nothing trustworthy to compare.
            Ok(memory) if memory.len() == len => digest(&memory) != digest(&disk_header[..len]),
            _ => false,
        }
    }

    /// MODIFIED_CODE: the overlap of the subregion with one executable
    /// section, memory vs disk. Only the file-backed prefix is compared;
    /// the zero-fill tail has no disk counterpart.
    fn section_diverges(
        &self,
        snapshot: &ProcessSnapshot,
        image_base: u64,
        sub: &Subregion,
        section: &SectionHeader,
        image: &crate::pe::MappedImage,
    ) -> bool {
        let (rva_lo, rva_hi) = section.virtual_extent();
        let section_start = image_base + rva_lo as u64;
        let section_end = image_base + rva_hi as u64;

        let mem_start = sub.base_va().max(section_start);
        let mem_end = sub.end_va().min(section_end);
        if mem_start >= mem_end {
            return false;
        }

        let raw = image.section_bytes(section);
        let into_section = (mem_start - section_start) as usize;
        let disk_avail = raw.len().saturating_sub(into_section);
        let len = ((mem_end - mem_start) as usize)
            .min(disk_avail)
            .min(MAX_COMPARE_BYTES);
        if len == 0 {
            return false;
        }

        match snapshot.process().read_memory(mem_start, len) {
            Ok(memory) if memory.len() == len => {
                digest(&memory) != digest(&raw[into_section..into_section + len])
            }
            _ => false,
        }
    }
}

fn digest(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// (read, write, execute) projection of a protection value; copy-on-write
/// counts as writable.
fn protect_projection(protect: u32) -> (bool, bool, bool) {
    (
        protect_is_readable(protect),
        protect_is_writable(protect),
        protect_is_executable(protect),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::types::{
        PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_READONLY, PAGE_WRITECOPY,
    };

    #[test]
    fn test_protect_projection_folds_copy_on_write() {
        assert_eq!(protect_projection(PAGE_WRITECOPY), (true, true, false));
        assert_eq!(
            protect_projection(PAGE_EXECUTE_READWRITE),
            (true, true, true)
        );
        assert_eq!(protect_projection(PAGE_EXECUTE_READ), (true, false, true));
        assert_eq!(protect_projection(PAGE_READONLY), (true, false, false));
    }

    #[test]
    fn test_digest_distinguishes_content() {
        assert_eq!(digest(b"abc"), digest(b"abc"));
        assert_ne!(digest(b"abc"), digest(b"abd"));
    }
}
