//! Snapshot construction: the ordered open protocol and the region walk.

use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::error::{GostirError, Result};
use crate::memory::entity::{Entity, EntityContext};
use crate::memory::subregion::Subregion;
use crate::os::types::{ModuleInfo, MEM_FREE};
use crate::os::{OsApi, ProcessAccess};
use crate::process::peb;
use crate::process::thread::Thread;

/// A reconstructed view of one process's address space.
///
/// The snapshot exclusively owns the process session it was built over.
/// `entities` is declared before `process` so entities drop first; entity
/// teardown may still hold loans tied to the session.
pub struct ProcessSnapshot {
    pid: u32,
    name: String,
    image_path: PathBuf,
    wow64: bool,
    heaps: Vec<u64>,
    threads: Vec<Thread>,
    entities: BTreeMap<u64, Entity>,
    process: Box<dyn ProcessAccess>,
}

impl std::fmt::Debug for ProcessSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSnapshot")
            .field("pid", &self.pid)
            .field("name", &self.name)
            .field("image_path", &self.image_path)
            .field("wow64", &self.wow64)
            .field("heaps", &self.heaps)
            .field("threads", &self.threads)
            .field("entities", &self.entities)
            .finish_non_exhaustive()
    }
}

impl ProcessSnapshot {
    /// Open `pid` and reconstruct its address space.
    ///
    /// The protocol runs in a fixed order: identity, architecture gate,
    /// PEB heap list, thread list, region walk. Identity and heap
    /// failures degrade; an unopenable process, a cross-architecture
    /// pairing, a failed thread query, or a malformed backing image
    /// aborts construction.
    pub fn open(pid: u32, os: &dyn OsApi) -> Result<Self> {
        let process = os
            .open_process(pid)
            .map_err(|source| GostirError::OpenFailed { pid, source })?;

        // Identity. Failure leaves both fields empty and the snapshot
        // still usable.
        let (name, image_path) = match Self::resolve_identity(os, process.as_ref()) {
            Some(identity) => identity,
            None => {
                warn!(pid, "could not resolve process identity");
                (String::new(), PathBuf::new())
            }
        };
        debug!(pid, name = %name, "mapping address space");

        // Architecture gate. A compatibility-layer inspector cannot map a
        // native target's full address space.
        let wow64 = match process.is_compat_layer() {
            Ok(target_compat) => {
                if os.inspector_is_compat() && !target_compat {
                    return Err(GostirError::ArchitectureMismatch { pid });
                }
                target_compat
            }
            Err(err) => {
                warn!(pid, %err, "compatibility query failed, assuming native target");
                false
            }
        };

        let heaps = peb::read_heap_list(process.as_ref(), wow64);

        let threads = Self::collect_threads(pid, os, process.as_ref())?;
        debug!(pid, threads = threads.len(), "thread list captured");

        let modules = process.modules();
        let entities = Self::walk_regions(os, process.as_ref(), &heaps, &threads, &modules)?;
        debug!(pid, entities = entities.len(), "address space reconstructed");

        Ok(Self {
            pid,
            name,
            image_path,
            wow64,
            heaps,
            threads,
            entities,
            process,
        })
    }

    fn resolve_identity(
        os: &dyn OsApi,
        process: &dyn ProcessAccess,
    ) -> Option<(String, PathBuf)> {
        let name = process.base_name().ok()?;
        let device = process.device_image_path().ok()?;
        let path = os.translate_device_path(&device)?;
        Some((name, path))
    }

    fn collect_threads(
        pid: u32,
        os: &dyn OsApi,
        process: &dyn ProcessAccess,
    ) -> Result<Vec<Thread>> {
        let system = match os.system_threads() {
            Ok(list) => list,
            Err(err) => {
                warn!(pid, %err, "system thread list unavailable");
                return Ok(Vec::new());
            }
        };

        let mut threads = Vec::new();
        for entry in system.into_iter().filter(|t| t.owner_pid == pid) {
            let info = os.query_thread(entry.tid, process).map_err(|source| {
                GostirError::ThreadQueryFailed {
                    pid,
                    tid: entry.tid,
                    source,
                }
            })?;
            threads.push(Thread::from_info(info));
        }
        Ok(threads)
    }

    /// Walk the address space from zero, grouping consecutive subregions
    /// by allocation base. Free space separates allocations and is not
    /// modeled. A failed query ends the walk; whatever group is pending
    /// at that point is still finalized.
    fn walk_regions(
        os: &dyn OsApi,
        process: &dyn ProcessAccess,
        heaps: &[u64],
        threads: &[Thread],
        modules: &[ModuleInfo],
    ) -> Result<BTreeMap<u64, Entity>> {
        let ctx = EntityContext {
            os,
            process,
            heaps,
            threads,
            modules,
        };

        let mut entities = BTreeMap::new();
        let mut pending: Vec<Subregion> = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let Some(info) = process.query_region(cursor) else {
                break;
            };
            let Some(next) = info.base_address.checked_add(info.region_size) else {
                break;
            };
            if next <= cursor {
                // A stalled cursor would walk the same region forever.
                break;
            }
            cursor = next;

            if info.state == MEM_FREE {
                continue;
            }

            if let Some(first) = pending.first() {
                if info.allocation_base != first.alloc_base() {
                    Self::finalize_group(&ctx, &mut entities, std::mem::take(&mut pending))?;
                }
            }
            pending.push(Subregion::new(info));
        }

        // The walk can end mid-group when the target unmaps behind us;
        // the subregions observed so far still form an entity.
        if !pending.is_empty() {
            Self::finalize_group(&ctx, &mut entities, pending)?;
        }

        Ok(entities)
    }

    fn finalize_group(
        ctx: &EntityContext<'_>,
        entities: &mut BTreeMap<u64, Entity>,
        group: Vec<Subregion>,
    ) -> Result<()> {
        let entity = Entity::build(ctx, group)?;
        entities.insert(entity.start_va(), entity);
        Ok(())
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Base name of the main module; empty when identity resolution
    /// degraded.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Canonical path of the main image; empty when identity resolution
    /// degraded.
    pub fn image_path(&self) -> &PathBuf {
        &self.image_path
    }

    pub fn is_wow64(&self) -> bool {
        self.wow64
    }

    /// PEB-listed heap bases, in PEB order.
    pub fn heaps(&self) -> &[u64] {
        &self.heaps
    }

    pub fn threads(&self) -> &[Thread] {
        &self.threads
    }

    /// Entities in ascending allocation-base order.
    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn entity_at(&self, alloc_base: u64) -> Option<&Entity> {
        self.entities.get(&alloc_base)
    }

    /// The entity whose extent contains `address`.
    pub fn entity_containing(&self, address: u64) -> Option<&Entity> {
        self.entities
            .range(..=address)
            .next_back()
            .map(|(_, e)| e)
            .filter(|e| e.contains(address))
    }

    /// The open session this snapshot owns.
    pub fn process(&self) -> &dyn ProcessAccess {
        self.process.as_ref()
    }
}
