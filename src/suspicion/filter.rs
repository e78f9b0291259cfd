//! Benign-pattern filtering to a fixed point.
//!
//! Each sweep walks the map read-only and records removal decisions, then
//! applies them; sweeps repeat until one comes back empty. Equivalent to
//! restarting the walk after every deletion, without the iterator
//! bookkeeping.

use tracing::debug;

use crate::config::FilterConfig;
use crate::memory::subregion::SUBREGION_FLAG_HEAP;
use crate::process::snapshot::ProcessSnapshot;
use crate::suspicion::{Suspicion, SuspicionKind, SuspicionMap};

const WINMD_SUFFIX: &str = ".winmd";

impl SuspicionMap {
    /// Remove known-benign findings until no filter applies. Idempotent:
    /// a second call over the same snapshot removes nothing.
    pub fn filter(&mut self, snapshot: &ProcessSnapshot, config: &FilterConfig) {
        loop {
            let removals = self.collect_removals(snapshot, config);
            if removals.is_empty() {
                break;
            }
            debug!(count = removals.len(), "dropping filtered suspicions");
            // Indices are applied highest-first so earlier removals in the
            // same list do not shift later ones.
            for (alloc_base, subregion_base, index) in removals.into_iter().rev() {
                self.remove(alloc_base, subregion_base, index);
            }
        }
    }

    fn collect_removals(
        &self,
        snapshot: &ProcessSnapshot,
        config: &FilterConfig,
    ) -> Vec<(u64, u64, usize)> {
        let mut removals = Vec::new();
        for (alloc_base, subregions) in self.entities() {
            for (&subregion_base, list) in subregions.iter() {
                for (index, suspicion) in list.iter().enumerate() {
                    if is_benign(snapshot, config, suspicion) {
                        removals.push((alloc_base, subregion_base, index));
                    }
                }
            }
        }
        removals
    }
}

fn is_benign(snapshot: &ProcessSnapshot, config: &FilterConfig, suspicion: &Suspicion) -> bool {
    match suspicion.kind {
        SuspicionKind::MissingPebModule => is_signed_metadata_module(snapshot, suspicion),
        SuspicionKind::PrivateExec => {
            config.suppress_heap_private_exec && is_heap_subregion(snapshot, suspicion)
        }
        _ => false,
    }
}

/// Signed metadata PEs (`.winmd`) load outside the loader's module list
/// by design: signed, entry point zero, metadata-only. They are the one
/// sanctioned source of missing-module images.
fn is_signed_metadata_module(snapshot: &ProcessSnapshot, suspicion: &Suspicion) -> bool {
    let Some(meta) = snapshot
        .entity_at(suspicion.alloc_base)
        .and_then(|e| e.image())
    else {
        return false;
    };
    if !meta.signing.signed {
        return false;
    }
    let has_winmd_suffix = meta.path.as_ref().is_some_and(|p| {
        p.to_string_lossy()
            .to_ascii_lowercase()
            .ends_with(WINMD_SUFFIX)
    });
    has_winmd_suffix && meta.pe.as_ref().is_some_and(|pe| pe.entry_point() == 0)
}

fn is_heap_subregion(snapshot: &ProcessSnapshot, suspicion: &Suspicion) -> bool {
    snapshot
        .entity_at(suspicion.alloc_base)
        .and_then(|e| e.subregion_at(suspicion.subregion_base))
        .is_some_and(|s| s.flags() & SUBREGION_FLAG_HEAP != 0)
}
