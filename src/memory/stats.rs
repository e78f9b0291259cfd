//! Permission and type statistics over a snapshot.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::memory::entity::EntityKind;
use crate::process::snapshot::ProcessSnapshot;

/// Counts for one bucket of subregions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BucketCounts {
    pub subregions: usize,
    pub committed_bytes: u64,
}

/// Aggregate statistics for a snapshot: committed footprint per entity
/// class and per protection mnemonic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SnapshotStats {
    pub private: BucketCounts,
    pub mapped: BucketCounts,
    pub image: BucketCounts,
    /// Keyed by trimmed protection mnemonic (`"RWX"`, `"R"`, ...),
    /// committed subregions only.
    pub by_protection: BTreeMap<String, BucketCounts>,
}

impl SnapshotStats {
    pub fn collect(snapshot: &ProcessSnapshot) -> Self {
        let mut stats = Self::default();
        for entity in snapshot.entities() {
            let bucket = match entity.kind() {
                EntityKind::Private => &mut stats.private,
                EntityKind::MappedFile { .. } => &mut stats.mapped,
                EntityKind::Image(_) => &mut stats.image,
            };
            for sub in entity.subregions() {
                bucket.subregions += 1;
                if !sub.is_committed() {
                    continue;
                }
                bucket.committed_bytes += sub.size();
                let entry = stats
                    .by_protection
                    .entry(sub.attrib_desc().trim_end().to_string())
                    .or_default();
                entry.subregions += 1;
                entry.committed_bytes += sub.size();
            }
        }
        stats
    }

    /// Total committed bytes across all classes.
    pub fn committed_total(&self) -> u64 {
        self.private.committed_bytes + self.mapped.committed_bytes + self.image.committed_bytes
    }
}
