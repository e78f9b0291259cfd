//! Scripted operating-system backend for tests.
//!
//! [`FixtureOs`] replays a scripted process (regions, memory contents,
//! threads, modules, backing files, signing verdicts) through the same
//! traits the live backend implements, so snapshot construction and the
//! rule engine can be exercised end to end on any host. Fixtures are
//! assembled with a builder; [`ImageFileBuilder`] produces the matching
//! synthetic PE files.
//!
//! When an image allocation's backing file is scripted, `build` seeds the
//! fixture memory with the file's header and section bytes the way the
//! loader would, so a fixture is "unmodified" by default and tests
//! script explicit memory overrides to model tampering.

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::OsError;
use crate::os::types::{
    ModuleInfo, RegionInfo, SigningInfo, SystemThread, ThreadInfo, MEM_COMMIT, MEM_FREE,
    MEM_IMAGE, MEM_MAPPED, MEM_PRIVATE, PAGE_NOACCESS,
};
use crate::os::{OsApi, ProcessAccess, SigningOracle};
use crate::pe::types::{PE32PLUS_MAGIC, PE_SIGNATURE};
use crate::pe::MappedImage;

const FIXTURE_PEB64: u64 = 0x7FFD_0000;
const FIXTURE_PEB32: u64 = 0x7EFD_0000;

// Offsets shared with the PEB reader.
const PEB64_NUMBER_OF_HEAPS: usize = 0xE8;
const PEB64_PROCESS_HEAPS: usize = 0xF0;
const PEB32_NUMBER_OF_HEAPS: usize = 0x88;
const PEB32_PROCESS_HEAPS: usize = 0x90;

struct FixtureState {
    pid: u32,
    open_fails: bool,
    identity_fails: bool,
    image_name: String,
    image_device_path: String,
    inspector_compat: bool,
    target_compat: bool,
    compat_query_fails: bool,
    peb_address: Option<u64>,
    regions: Vec<RegionInfo>,
    memory: Vec<(u64, Vec<u8>)>,
    mapped_paths: Vec<(u64, String)>,
    device_prefixes: Vec<(String, String)>,
    files: Vec<(PathBuf, Vec<u8>)>,
    signing: Vec<(PathBuf, SigningInfo)>,
    modules: Vec<ModuleInfo>,
    threads: Vec<ThreadInfo>,
    thread_failures: BTreeSet<u32>,
    foreign_threads: Vec<SystemThread>,
    query_limit: Option<usize>,
}

/// Scripted OS context.
pub struct FixtureOs {
    state: Arc<FixtureState>,
}

impl FixtureOs {
    pub fn builder() -> FixtureOsBuilder {
        FixtureOsBuilder::new()
    }
}

/// Builder for [`FixtureOs`]. Defaults describe a healthy native 64-bit
/// target with pid 4242 and an empty address space.
pub struct FixtureOsBuilder {
    state: FixtureState,
    explicit_memory: Vec<(u64, Vec<u8>)>,
    heaps: Vec<u64>,
    peb_disabled: bool,
}

impl Default for FixtureOsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FixtureOsBuilder {
    pub fn new() -> Self {
        Self {
            state: FixtureState {
                pid: 4242,
                open_fails: false,
                identity_fails: false,
                image_name: "fixture.exe".to_string(),
                image_device_path: r"\Device\HarddiskVolume2\fixture\fixture.exe".to_string(),
                inspector_compat: false,
                target_compat: false,
                compat_query_fails: false,
                peb_address: None,
                regions: Vec::new(),
                memory: Vec::new(),
                mapped_paths: Vec::new(),
                device_prefixes: vec![(r"\Device\HarddiskVolume2".to_string(), "C:".to_string())],
                files: Vec::new(),
                signing: Vec::new(),
                modules: Vec::new(),
                threads: Vec::new(),
                thread_failures: BTreeSet::new(),
                foreign_threads: Vec::new(),
                query_limit: None,
            },
            explicit_memory: Vec::new(),
            heaps: Vec::new(),
            peb_disabled: false,
        }
    }

    pub fn pid(mut self, pid: u32) -> Self {
        self.state.pid = pid;
        self
    }

    pub fn open_fails(mut self) -> Self {
        self.state.open_fails = true;
        self
    }

    pub fn identity_fails(mut self) -> Self {
        self.state.identity_fails = true;
        self
    }

    pub fn image_name(mut self, name: &str) -> Self {
        self.state.image_name = name.to_string();
        self
    }

    pub fn image_device_path(mut self, path: &str) -> Self {
        self.state.image_device_path = path.to_string();
        self
    }

    pub fn inspector_compat(mut self, compat: bool) -> Self {
        self.state.inspector_compat = compat;
        self
    }

    pub fn target_compat(mut self, compat: bool) -> Self {
        self.state.target_compat = compat;
        self
    }

    pub fn compat_query_fails(mut self) -> Self {
        self.state.compat_query_fails = true;
        self
    }

    /// The target reports no PEB address at all.
    pub fn no_peb(mut self) -> Self {
        self.peb_disabled = true;
        self
    }

    /// Script a raw region descriptor.
    pub fn region(mut self, info: RegionInfo) -> Self {
        self.state.regions.push(info);
        self
    }

    /// One committed private allocation of a single subregion.
    pub fn private_region(self, base: u64, size: u64, protect: u32) -> Self {
        self.region(RegionInfo {
            base_address: base,
            allocation_base: base,
            allocation_protect: protect,
            region_size: size,
            state: MEM_COMMIT,
            protect,
            region_type: MEM_PRIVATE,
            private_size: size,
        })
    }

    /// One committed subregion of a mapped-file allocation.
    pub fn mapped_region(mut self, base: u64, size: u64, protect: u32, device_path: &str) -> Self {
        self.state
            .mapped_paths
            .push((base, device_path.to_string()));
        self.region(RegionInfo {
            base_address: base,
            allocation_base: base,
            allocation_protect: protect,
            region_size: size,
            state: MEM_COMMIT,
            protect,
            region_type: MEM_MAPPED,
            private_size: 0,
        })
    }

    /// One committed image-typed subregion within the allocation at
    /// `alloc_base`.
    pub fn image_subregion(self, base: u64, alloc_base: u64, size: u64, protect: u32) -> Self {
        self.region(RegionInfo {
            base_address: base,
            allocation_base: alloc_base,
            allocation_protect: protect,
            region_size: size,
            state: MEM_COMMIT,
            protect,
            region_type: MEM_IMAGE,
            private_size: 0,
        })
    }

    /// Associate an image allocation with its mapped-section device path.
    pub fn image_backing(mut self, alloc_base: u64, device_path: &str) -> Self {
        self.state
            .mapped_paths
            .push((alloc_base, device_path.to_string()));
        self
    }

    /// Script memory contents; overrides loader-seeded image bytes.
    pub fn memory(mut self, address: u64, bytes: Vec<u8>) -> Self {
        self.explicit_memory.push((address, bytes));
        self
    }

    pub fn heap(mut self, base: u64) -> Self {
        self.heaps.push(base);
        self
    }

    pub fn thread(mut self, info: ThreadInfo) -> Self {
        self.state.threads.push(info);
        self
    }

    pub fn thread_query_fails(mut self, tid: u32) -> Self {
        self.state.thread_failures.insert(tid);
        self
    }

    /// A thread owned by some other process; must never surface in the
    /// snapshot.
    pub fn foreign_thread(mut self, tid: u32, owner_pid: u32) -> Self {
        self.state.foreign_threads.push(SystemThread { tid, owner_pid });
        self
    }

    pub fn module(mut self, name: &str, base: u64, size: u64, entry_point: u64, path: &str) -> Self {
        self.state.modules.push(ModuleInfo {
            name: name.to_string(),
            base,
            size,
            entry_point,
            path: path.to_string(),
        });
        self
    }

    pub fn device_prefix(mut self, device: &str, drive: &str) -> Self {
        self.state
            .device_prefixes
            .push((device.to_string(), drive.to_string()));
        self
    }

    pub fn file(mut self, path: &str, bytes: Vec<u8>) -> Self {
        self.state.files.push((PathBuf::from(path), bytes));
        self
    }

    pub fn signing(mut self, path: &str, info: SigningInfo) -> Self {
        self.state.signing.push((PathBuf::from(path), info));
        self
    }

    /// Region queries beyond the first `limit` fail, as if the walked
    /// space vanished mid-enumeration.
    pub fn query_limit(mut self, limit: usize) -> Self {
        self.state.query_limit = Some(limit);
        self
    }

    pub fn build(mut self) -> FixtureOs {
        self.state.regions.sort_by_key(|r| r.base_address);

        if !self.peb_disabled {
            self.seed_peb();
        }
        self.seed_image_memory();
        // Explicit scripts land last so they win over loader seeding.
        self.state.memory.append(&mut self.explicit_memory);

        FixtureOs {
            state: Arc::new(self.state),
        }
    }

    /// Lay out a PEB and heap-pointer table in fixture memory.
    fn seed_peb(&mut self) {
        let compat = self.state.target_compat;
        let peb = if compat { FIXTURE_PEB32 } else { FIXTURE_PEB64 };
        self.state.peb_address = Some(peb);

        let table = peb + 0x1000;
        if compat {
            let mut head = vec![0u8; 0x98];
            head[PEB32_NUMBER_OF_HEAPS..PEB32_NUMBER_OF_HEAPS + 4]
                .copy_from_slice(&(self.heaps.len() as u32).to_le_bytes());
            head[PEB32_PROCESS_HEAPS..PEB32_PROCESS_HEAPS + 4]
                .copy_from_slice(&(table as u32).to_le_bytes());
            let mut entries = Vec::with_capacity(self.heaps.len() * 4);
            for &h in &self.heaps {
                entries.extend_from_slice(&(h as u32).to_le_bytes());
            }
            self.state.memory.push((peb, head));
            self.state.memory.push((table, entries));
        } else {
            let mut head = vec![0u8; 0xF8];
            head[PEB64_NUMBER_OF_HEAPS..PEB64_NUMBER_OF_HEAPS + 4]
                .copy_from_slice(&(self.heaps.len() as u32).to_le_bytes());
            head[PEB64_PROCESS_HEAPS..PEB64_PROCESS_HEAPS + 8]
                .copy_from_slice(&table.to_le_bytes());
            let mut entries = Vec::with_capacity(self.heaps.len() * 8);
            for &h in &self.heaps {
                entries.extend_from_slice(&h.to_le_bytes());
            }
            self.state.memory.push((peb, head));
            self.state.memory.push((table, entries));
        }
    }

    /// Map scripted image files into fixture memory the way the loader
    /// would: headers at the base, raw section bytes at their RVAs.
    fn seed_image_memory(&mut self) {
        let mut seeded = Vec::new();
        for &(alloc_base, ref device) in &self.state.mapped_paths {
            let is_image = self
                .state
                .regions
                .iter()
                .any(|r| r.allocation_base == alloc_base && r.region_type == MEM_IMAGE);
            if !is_image {
                continue;
            }
            let Some(path) = translate(&self.state.device_prefixes, device) else {
                continue;
            };
            let Some((_, bytes)) = self.state.files.iter().find(|(p, _)| *p == path) else {
                continue;
            };
            let Ok(image) = MappedImage::from_bytes(bytes.clone()) else {
                continue;
            };
            seeded.push((alloc_base, image.header_bytes().to_vec()));
            for section in image.sections().sections() {
                let raw = image.section_bytes(section);
                if !raw.is_empty() {
                    seeded.push((alloc_base + section.virtual_address as u64, raw.to_vec()));
                }
            }
        }
        self.state.memory.extend(seeded);
    }
}

fn translate(prefixes: &[(String, String)], device_path: &str) -> Option<PathBuf> {
    prefixes.iter().find_map(|(device, drive)| {
        device_path
            .strip_prefix(device.as_str())
            .map(|rest| PathBuf::from(format!("{drive}{rest}")))
    })
}

impl OsApi for FixtureOs {
    fn open_process(&self, pid: u32) -> Result<Box<dyn ProcessAccess>, OsError> {
        if self.state.open_fails || pid != self.state.pid {
            return Err(OsError::new("OpenProcess", 5));
        }
        Ok(Box::new(FixtureProcess {
            state: Arc::clone(&self.state),
            queries: AtomicUsize::new(0),
        }))
    }

    fn inspector_is_compat(&self) -> bool {
        self.state.inspector_compat
    }

    fn system_threads(&self) -> Result<Vec<SystemThread>, OsError> {
        let mut list: Vec<SystemThread> = self
            .state
            .threads
            .iter()
            .map(|t| SystemThread {
                tid: t.tid,
                owner_pid: self.state.pid,
            })
            .collect();
        list.extend(self.state.foreign_threads.iter().copied());
        Ok(list)
    }

    fn query_thread(
        &self,
        tid: u32,
        _process: &dyn ProcessAccess,
    ) -> Result<ThreadInfo, OsError> {
        if self.state.thread_failures.contains(&tid) {
            return Err(OsError::new("OpenThread", 0x57));
        }
        self.state
            .threads
            .iter()
            .find(|t| t.tid == tid)
            .copied()
            .ok_or_else(|| OsError::new("OpenThread", 0x57))
    }

    fn translate_device_path(&self, device_path: &str) -> Option<PathBuf> {
        translate(&self.state.device_prefixes, device_path)
    }

    fn read_image_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.state
            .files
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, bytes)| bytes.clone())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such fixture file"))
    }

    fn signing(&self) -> &dyn SigningOracle {
        self
    }
}

impl SigningOracle for FixtureOs {
    fn classify(&self, path: &Path) -> SigningInfo {
        self.state
            .signing
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, info)| *info)
            .unwrap_or_else(SigningInfo::unsigned)
    }
}

struct FixtureProcess {
    state: Arc<FixtureState>,
    queries: AtomicUsize,
}

impl ProcessAccess for FixtureProcess {
    fn pid(&self) -> u32 {
        self.state.pid
    }

    fn base_name(&self) -> Result<String, OsError> {
        if self.state.identity_fails {
            return Err(OsError::new("GetModuleBaseName", 6));
        }
        Ok(self.state.image_name.clone())
    }

    fn device_image_path(&self) -> Result<String, OsError> {
        if self.state.identity_fails {
            return Err(OsError::new("GetProcessImageFileName", 6));
        }
        Ok(self.state.image_device_path.clone())
    }

    fn is_compat_layer(&self) -> Result<bool, OsError> {
        if self.state.compat_query_fails {
            return Err(OsError::new("IsWow64Process", 6));
        }
        Ok(self.state.target_compat)
    }

    fn peb_address(&self, _compat: bool) -> Option<u64> {
        self.state.peb_address
    }

    fn read_memory(&self, address: u64, length: usize) -> Result<Vec<u8>, OsError> {
        let end = address.saturating_add(length as u64);

        let in_committed_region = self.state.regions.iter().any(|r| {
            r.state == MEM_COMMIT
                && address >= r.base_address
                && address < r.base_address + r.region_size
        });
        let in_segment = self
            .state
            .memory
            .iter()
            .any(|(base, bytes)| *base < end && address < base + bytes.len() as u64);
        if !in_committed_region && !in_segment {
            return Err(OsError::new("ReadProcessMemory", 0x12B));
        }

        let mut out = vec![0u8; length];
        for (base, bytes) in &self.state.memory {
            let seg_end = base + bytes.len() as u64;
            if *base >= end || seg_end <= address {
                continue;
            }
            let from = address.max(*base);
            let to = end.min(seg_end);
            let src = (from - base) as usize..(to - base) as usize;
            let dst = (from - address) as usize..(to - address) as usize;
            out[dst].copy_from_slice(&bytes[src]);
        }
        Ok(out)
    }

    fn query_region(&self, address: u64) -> Option<RegionInfo> {
        if let Some(limit) = self.state.query_limit {
            if self.queries.fetch_add(1, Ordering::Relaxed) >= limit {
                return None;
            }
        }

        // Containing region, or a synthesized free gap up to the next
        // scripted base, the way the live query reports unallocated space.
        for region in &self.state.regions {
            let end = region.base_address + region.region_size;
            if address >= region.base_address && address < end {
                return Some(region.clone());
            }
            if address < region.base_address {
                return Some(RegionInfo {
                    base_address: address,
                    allocation_base: 0,
                    allocation_protect: 0,
                    region_size: region.base_address - address,
                    state: MEM_FREE,
                    protect: PAGE_NOACCESS,
                    region_type: 0,
                    private_size: 0,
                });
            }
        }
        None
    }

    fn mapped_file_path(&self, base: u64) -> Option<String> {
        self.state
            .mapped_paths
            .iter()
            .find(|(b, _)| *b == base)
            .map(|(_, p)| p.clone())
    }

    fn modules(&self) -> Vec<ModuleInfo> {
        self.state.modules.clone()
    }
}

/// Builds synthetic 64-bit PE files for fixtures.
pub struct ImageFileBuilder {
    entry_point: u32,
    machine: u16,
    sections: Vec<SectionSpec>,
}

struct SectionSpec {
    name: [u8; 8],
    rva: u32,
    virtual_size: u32,
    raw: Vec<u8>,
    characteristics: u32,
}

const HEADERS_SIZE: u32 = 0x400;
const FILE_ALIGN: u32 = 0x200;
const SECTION_ALIGN: u32 = 0x1000;
const NT_OFFSET: u32 = 0x80;
const OPTIONAL_SIZE: u16 = 240; // PE32+ with 16 data directories

impl Default for ImageFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageFileBuilder {
    pub fn new() -> Self {
        Self {
            entry_point: 0,
            machine: 0x8664,
            sections: Vec::new(),
        }
    }

    pub fn entry_point(mut self, rva: u32) -> Self {
        self.entry_point = rva;
        self
    }

    pub fn section(
        mut self,
        name: &str,
        rva: u32,
        virtual_size: u32,
        raw: Vec<u8>,
        characteristics: u32,
    ) -> Self {
        let mut bytes = [0u8; 8];
        let len = name.len().min(8);
        bytes[..len].copy_from_slice(&name.as_bytes()[..len]);
        self.sections.push(SectionSpec {
            name: bytes,
            rva,
            virtual_size,
            raw,
            characteristics,
        });
        self
    }

    pub fn build(self) -> Vec<u8> {
        let align = |v: u32, to: u32| v.div_ceil(to) * to;

        let size_of_image = self
            .sections
            .iter()
            .map(|s| align(s.rva + s.virtual_size.max(s.raw.len() as u32), SECTION_ALIGN))
            .max()
            .unwrap_or(SECTION_ALIGN)
            .max(SECTION_ALIGN);

        // Assign raw data offsets after the headers, file-aligned.
        let mut raw_offsets = Vec::with_capacity(self.sections.len());
        let mut cursor = HEADERS_SIZE;
        for s in &self.sections {
            raw_offsets.push(cursor);
            cursor = align(cursor + s.raw.len() as u32, FILE_ALIGN);
        }

        let mut data = vec![0u8; cursor as usize];

        // DOS stub.
        data[0] = b'M';
        data[1] = b'Z';
        data[60..64].copy_from_slice(&NT_OFFSET.to_le_bytes());

        // NT signature and COFF header.
        let nt = NT_OFFSET as usize;
        data[nt..nt + 4].copy_from_slice(&PE_SIGNATURE);
        let coff = nt + 4;
        data[coff..coff + 2].copy_from_slice(&self.machine.to_le_bytes());
        data[coff + 2..coff + 4].copy_from_slice(&(self.sections.len() as u16).to_le_bytes());
        data[coff + 16..coff + 18].copy_from_slice(&OPTIONAL_SIZE.to_le_bytes());
        data[coff + 18..coff + 20].copy_from_slice(&0x2022u16.to_le_bytes());

        // Optional header (PE32+).
        let opt = coff + 20;
        data[opt..opt + 2].copy_from_slice(&PE32PLUS_MAGIC.to_le_bytes());
        data[opt + 16..opt + 20].copy_from_slice(&self.entry_point.to_le_bytes());
        data[opt + 24..opt + 32].copy_from_slice(&0x1_4000_0000u64.to_le_bytes());
        data[opt + 32..opt + 36].copy_from_slice(&SECTION_ALIGN.to_le_bytes());
        data[opt + 36..opt + 40].copy_from_slice(&FILE_ALIGN.to_le_bytes());
        data[opt + 56..opt + 60].copy_from_slice(&size_of_image.to_le_bytes());
        data[opt + 60..opt + 64].copy_from_slice(&HEADERS_SIZE.to_le_bytes());
        data[opt + 68..opt + 70].copy_from_slice(&2u16.to_le_bytes());
        data[opt + 108..opt + 112].copy_from_slice(&16u32.to_le_bytes());

        // Section table.
        let mut row = opt + OPTIONAL_SIZE as usize;
        for (s, &raw_at) in self.sections.iter().zip(&raw_offsets) {
            data[row..row + 8].copy_from_slice(&s.name);
            data[row + 8..row + 12].copy_from_slice(&s.virtual_size.to_le_bytes());
            data[row + 12..row + 16].copy_from_slice(&s.rva.to_le_bytes());
            data[row + 16..row + 20].copy_from_slice(&(s.raw.len() as u32).to_le_bytes());
            data[row + 20..row + 24].copy_from_slice(&raw_at.to_le_bytes());
            data[row + 36..row + 40].copy_from_slice(&s.characteristics.to_le_bytes());
            row += 40;
        }

        // Raw section data.
        for (s, &raw_at) in self.sections.iter().zip(&raw_offsets) {
            let at = raw_at as usize;
            data[at..at + s.raw.len()].copy_from_slice(&s.raw);
        }

        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::types::{PAGE_READONLY, PAGE_READWRITE};

    #[test]
    fn test_query_region_synthesizes_free_gaps() {
        let os = FixtureOs::builder()
            .private_region(0x1000_0000, 0x4000, PAGE_READWRITE)
            .build();
        let process = os.open_process(4242).unwrap();

        let gap = process.query_region(0).unwrap();
        assert_eq!(gap.state, MEM_FREE);
        assert_eq!(gap.region_size, 0x1000_0000);

        let real = process.query_region(0x1000_0000).unwrap();
        assert_eq!(real.state, MEM_COMMIT);

        assert!(process.query_region(0x1000_4000).is_none());
    }

    #[test]
    fn test_read_memory_zero_fills_unscripted_committed() {
        let os = FixtureOs::builder()
            .private_region(0x2000_0000, 0x1000, PAGE_READONLY)
            .memory(0x2000_0010, vec![0xAA; 4])
            .build();
        let process = os.open_process(4242).unwrap();

        let bytes = process.read_memory(0x2000_0000, 0x20).unwrap();
        assert_eq!(&bytes[..0x10], &[0u8; 0x10]);
        assert_eq!(&bytes[0x10..0x14], &[0xAA; 4]);

        assert!(process.read_memory(0x9000_0000, 16).is_err());
    }

    #[test]
    fn test_open_rejects_unknown_pid() {
        let os = FixtureOs::builder().pid(7).build();
        assert!(os.open_process(8).is_err());
        assert!(os.open_process(7).is_ok());
    }

    #[test]
    fn test_image_file_builder_round_trips_through_parser() {
        let bytes = ImageFileBuilder::new()
            .entry_point(0x1234)
            .section(".text", 0x1000, 0x1000, vec![0x90; 0x80], 0x6000_0020)
            .build();
        let image = MappedImage::from_bytes(bytes).unwrap();
        assert_eq!(image.entry_point(), 0x1234);
        assert_eq!(image.sections().sections()[0].name(), ".text");
    }
}
