//! Process-environment-block heap enumeration.
//!
//! The toolhelp snapshot cannot enumerate heaps across architectures, so
//! the heap list is read straight out of the target's PEB: the
//! `NumberOfHeaps` count, then that many pointers from `ProcessHeaps`.
//! The layout is chosen by the target's architecture view, not the
//! inspector's. Any failure along the way degrades to an empty list.

use tracing::{debug, warn};

use crate::os::ProcessAccess;

// Field offsets within the 64-bit PEB.
const PEB64_NUMBER_OF_HEAPS: usize = 0xE8;
const PEB64_PROCESS_HEAPS: usize = 0xF0;
const PEB64_READ_SIZE: usize = 0xF8;

// Field offsets within the 32-bit PEB.
const PEB32_NUMBER_OF_HEAPS: usize = 0x88;
const PEB32_PROCESS_HEAPS: usize = 0x90;
const PEB32_READ_SIZE: usize = 0x98;

// Cap on NumberOfHeaps; a larger count means a corrupt or hostile PEB.
const MAX_HEAPS: usize = 4096;

/// Read the target's heap base addresses. `compat` selects the 32-bit
/// PEB layout for compatibility-layer targets.
pub(crate) fn read_heap_list(process: &dyn ProcessAccess, compat: bool) -> Vec<u64> {
    let Some(peb) = process.peb_address(compat) else {
        warn!("no PEB address reported, heap list unavailable");
        return Vec::new();
    };
    debug!(peb, compat, "reading PEB heap list");

    let result = if compat {
        read_heaps_32(process, peb)
    } else {
        read_heaps_64(process, peb)
    };

    match result {
        Some(heaps) => {
            debug!(count = heaps.len(), "heap list read");
            heaps
        }
        None => {
            warn!("PEB heap read failed, continuing without heap attribution");
            Vec::new()
        }
    }
}

fn read_heaps_64(process: &dyn ProcessAccess, peb: u64) -> Option<Vec<u64>> {
    let head = process.read_memory(peb, PEB64_READ_SIZE).ok()?;
    let count = u32_at(&head, PEB64_NUMBER_OF_HEAPS)? as usize;
    if count == 0 || count > MAX_HEAPS {
        return Some(Vec::new());
    }
    let table = u64_at(&head, PEB64_PROCESS_HEAPS)?;
    let raw = process.read_memory(table, count * 8).ok()?;
    Some(
        raw.chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect(),
    )
}

fn read_heaps_32(process: &dyn ProcessAccess, peb: u64) -> Option<Vec<u64>> {
    let head = process.read_memory(peb, PEB32_READ_SIZE).ok()?;
    let count = u32_at(&head, PEB32_NUMBER_OF_HEAPS)? as usize;
    if count == 0 || count > MAX_HEAPS {
        return Some(Vec::new());
    }
    let table = u32_at(&head, PEB32_PROCESS_HEAPS)? as u64;
    let raw = process.read_memory(table, count * 4).ok()?;
    Some(
        raw.chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()) as u64)
            .collect(),
    )
}

fn u32_at(data: &[u8], offset: usize) -> Option<u32> {
    data.get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
}

fn u64_at(data: &[u8], offset: usize) -> Option<u64> {
    data.get(offset..offset + 8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_le_bytes)
}
