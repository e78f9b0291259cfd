//! Typed findings and the three-level suspicion map.

pub mod filter;
pub mod rules;

pub use rules::SuspicionEngine;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The catalog of finding kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SuspicionKind {
    /// Executable protection on a private subregion.
    PrivateExec,
    /// Executable protection on a mapped, non-image subregion.
    MappedExec,
    /// Executable image section bytes differ from the backing file.
    ModifiedCode,
    /// Image header bytes differ from the backing file.
    ModifiedHeader,
    /// Subregion protection inconsistent with section characteristics.
    DiskPermissionMismatch,
    /// Image with no corresponding loader module entry.
    MissingPebModule,
    /// Image whose backing file cannot be read.
    PhantomImage,
    /// Image with no executable memory at all.
    NonExecutableImage,
}

impl SuspicionKind {
    /// Whether findings of this kind describe the whole entity rather
    /// than one subregion.
    pub fn is_entity_scope(&self) -> bool {
        matches!(
            self,
            Self::MissingPebModule | Self::PhantomImage | Self::NonExecutableImage
        )
    }

    /// Human-readable description rendered next to the finding.
    pub fn description(&self) -> &'static str {
        match self {
            Self::PrivateExec => "Executable memory within a private allocation",
            Self::MappedExec => "Executable memory within a mapped file view",
            Self::ModifiedCode => "Executable section bytes differ from the backing file",
            Self::ModifiedHeader => "Image header differs from the backing file",
            Self::DiskPermissionMismatch => {
                "Protection inconsistent with image section characteristics"
            }
            Self::MissingPebModule => "Missing PEB module",
            Self::PhantomImage => "Phantom image: backing file unreadable",
            Self::NonExecutableImage => "Image contains no executable memory",
        }
    }
}

/// One finding, anchored to a subregion of one entity.
///
/// The anchor doubles as the entity reference: `alloc_base` keys the
/// owning entity in the snapshot's map, so the back-reference stays valid
/// for exactly the snapshot's lifetime without owning anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suspicion {
    pub kind: SuspicionKind,
    /// Allocation base of the entity this finding belongs to.
    pub alloc_base: u64,
    /// Base of the anchoring subregion; equals `alloc_base` for
    /// entity-scope findings.
    pub subregion_base: u64,
    /// True when the finding describes the entity as a whole.
    pub entity_scope: bool,
    /// Rendered description.
    pub description: String,
}

impl Suspicion {
    pub(crate) fn entity_scoped(kind: SuspicionKind, alloc_base: u64) -> Self {
        Self {
            kind,
            alloc_base,
            subregion_base: alloc_base,
            entity_scope: true,
            description: kind.description().to_string(),
        }
    }

    pub(crate) fn subregion_scoped(kind: SuspicionKind, alloc_base: u64, subregion_base: u64) -> Self {
        Self {
            kind,
            alloc_base,
            subregion_base,
            entity_scope: false,
            description: kind.description().to_string(),
        }
    }
}

/// Findings keyed by allocation base, then by subregion base.
///
/// Both levels iterate in ascending address order. An entity appears only
/// while at least one finding is attached beneath it; the filter pass
/// prunes entries as they empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspicionMap {
    entries: BTreeMap<u64, BTreeMap<u64, Vec<Suspicion>>>,
}

impl SuspicionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, suspicion: Suspicion) {
        self.entries
            .entry(suspicion.alloc_base)
            .or_default()
            .entry(suspicion.subregion_base)
            .or_default()
            .push(suspicion);
    }

    /// Iterate entities in ascending allocation-base order.
    pub fn entities(&self) -> impl Iterator<Item = (u64, &BTreeMap<u64, Vec<Suspicion>>)> {
        self.entries.iter().map(|(&base, subs)| (base, subs))
    }

    pub fn has_entity(&self, alloc_base: u64) -> bool {
        self.entries.contains_key(&alloc_base)
    }

    /// Findings anchored at one subregion.
    pub fn suspicions_at(&self, alloc_base: u64, subregion_base: u64) -> &[Suspicion] {
        self.entries
            .get(&alloc_base)
            .and_then(|subs| subs.get(&subregion_base))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Count of subregion-scope findings anchored at one subregion.
    pub fn subregion_scope_count(&self, alloc_base: u64, subregion_base: u64) -> usize {
        self.suspicions_at(alloc_base, subregion_base)
            .iter()
            .filter(|s| !s.entity_scope)
            .count()
    }

    /// Total findings across the whole map.
    pub fn len(&self) -> usize {
        self.entries
            .values()
            .flat_map(|subs| subs.values())
            .map(Vec::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn remove(&mut self, alloc_base: u64, subregion_base: u64, index: usize) {
        let Some(subs) = self.entries.get_mut(&alloc_base) else {
            return;
        };
        let Some(list) = subs.get_mut(&subregion_base) else {
            return;
        };
        if index < list.len() {
            list.remove(index);
        }
        if list.is_empty() {
            subs.remove(&subregion_base);
        }
        if subs.is_empty() {
            self.entries.remove(&alloc_base);
        }
    }
}
