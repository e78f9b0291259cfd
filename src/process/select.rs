//! Subregion selection queries over a snapshot.

use crate::memory::subregion::Subregion;
use crate::process::snapshot::ProcessSnapshot;
use crate::suspicion::SuspicionMap;

/// What to select from the address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemorySelection {
    /// Every subregion.
    All,
    /// The subregion at this base address, or the whole enclosing entity
    /// under [`SelectOptions::from_base`].
    Block(u64),
    /// Subregions carrying suspicions after filtering.
    Suspicious,
}

/// Selection modifiers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SelectOptions {
    /// Expand a subregion match to the entire enclosing entity.
    pub from_base: bool,
}

impl ProcessSnapshot {
    /// Return the subregions matching `selection`, in address order.
    ///
    /// `Suspicious` consults `suspicions`, which should already be
    /// filtered; without a map it selects nothing.
    pub fn select(
        &self,
        selection: MemorySelection,
        options: SelectOptions,
        suspicions: Option<&SuspicionMap>,
    ) -> Vec<&Subregion> {
        let mut selected = Vec::new();

        for entity in self.entities() {
            match selection {
                MemorySelection::All => {
                    selected.extend(entity.subregions().iter());
                }
                MemorySelection::Block(address) => {
                    if !entity.contains(address) {
                        continue;
                    }
                    selected.extend(
                        entity
                            .subregions()
                            .iter()
                            .filter(|s| options.from_base || s.base_va() == address),
                    );
                }
                MemorySelection::Suspicious => {
                    let Some(map) = suspicions else { continue };
                    if !map.has_entity(entity.start_va()) {
                        continue;
                    }
                    selected.extend(entity.subregions().iter().filter(|s| {
                        options.from_base
                            || map.subregion_scope_count(entity.start_va(), s.base_va()) > 0
                    }));
                }
            }
        }

        selected
    }
}
