//! Live Windows backend.
//!
//! Implements the collaborator traits over the Win32 and PSAPI surfaces.
//! The two NT information calls without stable Win32 wrappers are
//! resolved from ntdll once, when the context is constructed, and carried
//! as plain function pointers from then on.

#![cfg(windows)]

use std::ffi::c_void;
use std::io;
use std::mem;
use std::path::{Path, PathBuf};
use std::ptr;

use tracing::warn;
use windows::core::{s, w, GUID, PCWSTR};
use windows::Win32::Foundation::{CloseHandle, HANDLE, HMODULE, HWND};
use windows::Win32::Security::WinTrust::{
    WinVerifyTrust, WINTRUST_DATA, WINTRUST_DATA_0, WINTRUST_FILE_INFO, WTD_CHOICE_FILE,
    WTD_REVOKE_NONE, WTD_STATEACTION_CLOSE, WTD_STATEACTION_VERIFY, WTD_UI_NONE,
};
use windows::Win32::Storage::FileSystem::QueryDosDeviceW;
use windows::Win32::System::Diagnostics::Debug::ReadProcessMemory;
use windows::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, Thread32First, Thread32Next, TH32CS_SNAPTHREAD, THREADENTRY32,
};
use windows::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};
use windows::Win32::System::Memory::{VirtualQueryEx, MEMORY_BASIC_INFORMATION};
use windows::Win32::System::ProcessStatus::{
    K32EnumProcessModulesEx, K32GetMappedFileNameW, K32GetModuleBaseNameW,
    K32GetModuleFileNameExW, K32GetModuleInformation, K32GetProcessImageFileNameW,
    K32QueryWorkingSetEx, LIST_MODULES_ALL, MODULEINFO, PSAPI_WORKING_SET_EX_INFORMATION,
};
use windows::Win32::System::Threading::{
    GetCurrentProcess, IsWow64Process, OpenProcess, OpenThread, PROCESS_QUERY_INFORMATION,
    PROCESS_VM_READ, THREAD_QUERY_INFORMATION,
};

use crate::error::OsError;
use crate::os::types::{ModuleInfo, RegionInfo, SigningInfo, SigningKind, SigningLevel,
    SystemThread, ThreadInfo, MEM_COMMIT};
use crate::os::{OsApi, ProcessAccess, SigningOracle};

type NtQueryInformationProcessFn =
    unsafe extern "system" fn(HANDLE, u32, *mut c_void, u32, *mut u32) -> i32;
type NtQueryInformationThreadFn =
    unsafe extern "system" fn(HANDLE, u32, *mut c_void, u32, *mut u32) -> i32;

const PROCESS_BASIC_INFORMATION_CLASS: u32 = 0;
const PROCESS_WOW64_INFORMATION_CLASS: u32 = 26;
const THREAD_BASIC_INFORMATION_CLASS: u32 = 0;
const THREAD_QUERY_WIN32_START_ADDRESS_CLASS: u32 = 9;

// NT_TIB64 field offset for the committed stack limit.
const TEB_STACK_LIMIT_OFFSET: u64 = 0x10;

const PAGE_SIZE: u64 = 0x1000;
// Working-set queries above this page count are skipped; the query cost
// outweighs the value of private-size attribution for giant regions.
const MAX_WORKING_SET_PAGES: u64 = 0x40000;

#[repr(C)]
struct ProcessBasicInformation {
    exit_status: i32,
    peb_base_address: *mut c_void,
    affinity_mask: usize,
    base_priority: i32,
    unique_process_id: usize,
    inherited_from_unique_process_id: usize,
}

#[repr(C)]
struct ThreadBasicInformation {
    exit_status: i32,
    teb_base_address: *mut c_void,
    client_id: [usize; 2],
    affinity_mask: usize,
    priority: i32,
    base_priority: i32,
}

/// The live OS context. Construct once, reuse across snapshots.
pub struct WindowsOs {
    nt_query_process: Option<NtQueryInformationProcessFn>,
    nt_query_thread: Option<NtQueryInformationThreadFn>,
    signing: AuthenticodeOracle,
}

impl Default for WindowsOs {
    fn default() -> Self {
        Self::new()
    }
}

impl WindowsOs {
    pub fn new() -> Self {
        let (nt_query_process, nt_query_thread) = unsafe {
            match GetModuleHandleW(w!("ntdll.dll")) {
                Ok(ntdll) => (
                    GetProcAddress(ntdll, s!("NtQueryInformationProcess"))
                        .map(|f| mem::transmute::<_, NtQueryInformationProcessFn>(f)),
                    GetProcAddress(ntdll, s!("NtQueryInformationThread"))
                        .map(|f| mem::transmute::<_, NtQueryInformationThreadFn>(f)),
                ),
                Err(err) => {
                    warn!(%err, "ntdll unavailable, PEB and thread detail disabled");
                    (None, None)
                }
            }
        };
        Self {
            nt_query_process,
            nt_query_thread,
            signing: AuthenticodeOracle,
        }
    }
}

impl OsApi for WindowsOs {
    fn open_process(&self, pid: u32) -> Result<Box<dyn ProcessAccess>, OsError> {
        let handle = unsafe {
            OpenProcess(PROCESS_QUERY_INFORMATION | PROCESS_VM_READ, false, pid)
                .map_err(|e| OsError::new("OpenProcess", e.code().0 as i64))?
        };
        Ok(Box::new(WindowsProcess {
            handle,
            pid,
            nt_query_process: self.nt_query_process,
        }))
    }

    fn inspector_is_compat(&self) -> bool {
        let mut wow64 = windows::Win32::Foundation::BOOL::default();
        unsafe { IsWow64Process(GetCurrentProcess(), &mut wow64).is_ok() && wow64.as_bool() }
    }

    fn system_threads(&self) -> Result<Vec<SystemThread>, OsError> {
        let snapshot = unsafe {
            CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0)
                .map_err(|e| OsError::new("CreateToolhelp32Snapshot", e.code().0 as i64))?
        };

        let mut threads = Vec::new();
        let mut entry = THREADENTRY32 {
            dwSize: mem::size_of::<THREADENTRY32>() as u32,
            ..Default::default()
        };
        unsafe {
            if Thread32First(snapshot, &mut entry).is_ok() {
                loop {
                    threads.push(SystemThread {
                        tid: entry.th32ThreadID,
                        owner_pid: entry.th32OwnerProcessID,
                    });
                    if Thread32Next(snapshot, &mut entry).is_err() {
                        break;
                    }
                }
            }
            let _ = CloseHandle(snapshot);
        }
        Ok(threads)
    }

    fn query_thread(
        &self,
        tid: u32,
        process: &dyn ProcessAccess,
    ) -> Result<ThreadInfo, OsError> {
        let handle = unsafe {
            OpenThread(THREAD_QUERY_INFORMATION, false, tid)
                .map_err(|e| OsError::new("OpenThread", e.code().0 as i64))?
        };

        let mut entry_point = None;
        let mut teb = None;
        if let Some(query) = self.nt_query_thread {
            unsafe {
                let mut start: u64 = 0;
                if query(
                    handle,
                    THREAD_QUERY_WIN32_START_ADDRESS_CLASS,
                    &mut start as *mut u64 as *mut c_void,
                    mem::size_of::<u64>() as u32,
                    ptr::null_mut(),
                ) == 0
                    && start != 0
                {
                    entry_point = Some(start);
                }

                let mut tbi: ThreadBasicInformation = mem::zeroed();
                if query(
                    handle,
                    THREAD_BASIC_INFORMATION_CLASS,
                    &mut tbi as *mut ThreadBasicInformation as *mut c_void,
                    mem::size_of::<ThreadBasicInformation>() as u32,
                    ptr::null_mut(),
                ) == 0
                    && !tbi.teb_base_address.is_null()
                {
                    teb = Some(tbi.teb_base_address as u64);
                }
            }
        }
        unsafe {
            let _ = CloseHandle(handle);
        }

        // The committed stack limit lives in the remote TEB.
        let stack_pointer = teb.and_then(|teb| {
            process
                .read_memory(teb + TEB_STACK_LIMIT_OFFSET, 8)
                .ok()
                .and_then(|bytes| bytes.try_into().ok())
                .map(u64::from_le_bytes)
                .filter(|&sp| sp != 0)
        });

        Ok(ThreadInfo {
            tid,
            entry_point,
            teb,
            stack_pointer,
        })
    }

    fn translate_device_path(&self, device_path: &str) -> Option<PathBuf> {
        let mut target = [0u16; 512];
        for letter in b'A'..=b'Z' {
            let drive: Vec<u16> = [letter as u16, b':' as u16, 0].to_vec();
            let len = unsafe { QueryDosDeviceW(PCWSTR(drive.as_ptr()), Some(&mut target)) };
            if len == 0 {
                continue;
            }
            // The buffer holds NUL-separated device names; the first is
            // the active mapping.
            let device = wide_to_string(&target);
            if device.is_empty() {
                continue;
            }
            if let Some(rest) = device_path.strip_prefix(device.as_str()) {
                return Some(PathBuf::from(format!("{}:{rest}", letter as char)));
            }
        }
        None
    }

    fn read_image_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        let file = std::fs::File::open(path)?;
        let map = unsafe { memmap2::Mmap::map(&file)? };
        Ok(map.to_vec())
    }

    fn signing(&self) -> &dyn SigningOracle {
        &self.signing
    }
}

struct WindowsProcess {
    handle: HANDLE,
    pid: u32,
    nt_query_process: Option<NtQueryInformationProcessFn>,
}

impl Drop for WindowsProcess {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.handle);
        }
    }
}

impl WindowsProcess {
    fn private_size(&self, base: u64, size: u64) -> u64 {
        let pages = size / PAGE_SIZE;
        if pages == 0 || pages > MAX_WORKING_SET_PAGES {
            return 0;
        }
        let mut rows: Vec<PSAPI_WORKING_SET_EX_INFORMATION> = (0..pages)
            .map(|i| PSAPI_WORKING_SET_EX_INFORMATION {
                VirtualAddress: (base + i * PAGE_SIZE) as *mut c_void,
                ..Default::default()
            })
            .collect();
        let bytes = (rows.len() * mem::size_of::<PSAPI_WORKING_SET_EX_INFORMATION>()) as u32;
        let ok = unsafe {
            K32QueryWorkingSetEx(self.handle, rows.as_mut_ptr() as *mut c_void, bytes).as_bool()
        };
        if !ok {
            return 0;
        }
        rows.iter()
            .filter(|row| {
                let flags = unsafe { row.VirtualAttributes.Flags };
                let valid = flags & 1 != 0;
                let shared = (flags >> 15) & 1 != 0;
                valid && !shared
            })
            .count() as u64
            * PAGE_SIZE
    }
}

impl ProcessAccess for WindowsProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn base_name(&self) -> Result<String, OsError> {
        let mut buffer = [0u16; 512];
        let len = unsafe { K32GetModuleBaseNameW(self.handle, HMODULE::default(), &mut buffer) };
        if len == 0 {
            return Err(OsError::new("GetModuleBaseName", last_error()));
        }
        Ok(String::from_utf16_lossy(&buffer[..len as usize]))
    }

    fn device_image_path(&self) -> Result<String, OsError> {
        let mut buffer = [0u16; 1024];
        let len = unsafe { K32GetProcessImageFileNameW(self.handle, &mut buffer) };
        if len == 0 {
            return Err(OsError::new("GetProcessImageFileName", last_error()));
        }
        Ok(String::from_utf16_lossy(&buffer[..len as usize]))
    }

    fn is_compat_layer(&self) -> Result<bool, OsError> {
        let mut wow64 = windows::Win32::Foundation::BOOL::default();
        unsafe {
            IsWow64Process(self.handle, &mut wow64)
                .map_err(|e| OsError::new("IsWow64Process", e.code().0 as i64))?;
        }
        Ok(wow64.as_bool())
    }

    fn peb_address(&self, compat: bool) -> Option<u64> {
        let query = self.nt_query_process?;
        unsafe {
            if compat {
                let mut peb: *mut c_void = ptr::null_mut();
                let status = query(
                    self.handle,
                    PROCESS_WOW64_INFORMATION_CLASS,
                    &mut peb as *mut *mut c_void as *mut c_void,
                    mem::size_of::<*mut c_void>() as u32,
                    ptr::null_mut(),
                );
                (status == 0 && !peb.is_null()).then(|| peb as u64)
            } else {
                let mut pbi: ProcessBasicInformation = mem::zeroed();
                let status = query(
                    self.handle,
                    PROCESS_BASIC_INFORMATION_CLASS,
                    &mut pbi as *mut ProcessBasicInformation as *mut c_void,
                    mem::size_of::<ProcessBasicInformation>() as u32,
                    ptr::null_mut(),
                );
                (status == 0 && !pbi.peb_base_address.is_null())
                    .then(|| pbi.peb_base_address as u64)
            }
        }
    }

    fn read_memory(&self, address: u64, length: usize) -> Result<Vec<u8>, OsError> {
        let mut buffer = vec![0u8; length];
        let mut read = 0usize;
        unsafe {
            ReadProcessMemory(
                self.handle,
                address as *const c_void,
                buffer.as_mut_ptr() as *mut c_void,
                length,
                Some(&mut read),
            )
            .map_err(|e| OsError::new("ReadProcessMemory", e.code().0 as i64))?;
        }
        buffer.truncate(read);
        Ok(buffer)
    }

    fn query_region(&self, address: u64) -> Option<RegionInfo> {
        let mut mbi = MEMORY_BASIC_INFORMATION::default();
        let len = unsafe {
            VirtualQueryEx(
                self.handle,
                Some(address as *const c_void),
                &mut mbi,
                mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        if len == 0 {
            return None;
        }

        let private_size = if mbi.State.0 == MEM_COMMIT {
            self.private_size(mbi.BaseAddress as u64, mbi.RegionSize as u64)
        } else {
            0
        };

        Some(RegionInfo {
            base_address: mbi.BaseAddress as u64,
            allocation_base: mbi.AllocationBase as u64,
            allocation_protect: mbi.AllocationProtect.0,
            region_size: mbi.RegionSize as u64,
            state: mbi.State.0,
            protect: mbi.Protect.0,
            region_type: mbi.Type.0,
            private_size,
        })
    }

    fn mapped_file_path(&self, base: u64) -> Option<String> {
        let mut buffer = [0u16; 1024];
        let len = unsafe {
            K32GetMappedFileNameW(self.handle, base as *const c_void, &mut buffer)
        };
        (len != 0).then(|| String::from_utf16_lossy(&buffer[..len as usize]))
    }

    fn modules(&self) -> Vec<ModuleInfo> {
        let mut handles = vec![HMODULE::default(); 1024];
        let mut needed = 0u32;
        let ok = unsafe {
            K32EnumProcessModulesEx(
                self.handle,
                handles.as_mut_ptr(),
                (handles.len() * mem::size_of::<HMODULE>()) as u32,
                &mut needed,
                LIST_MODULES_ALL,
            )
            .as_bool()
        };
        if !ok {
            return Vec::new();
        }
        let count = (needed as usize / mem::size_of::<HMODULE>()).min(handles.len());

        let mut modules = Vec::with_capacity(count);
        for &module in &handles[..count] {
            let mut info = MODULEINFO::default();
            let have_info = unsafe {
                K32GetModuleInformation(
                    self.handle,
                    module,
                    &mut info,
                    mem::size_of::<MODULEINFO>() as u32,
                )
                .as_bool()
            };
            if !have_info {
                continue;
            }

            let mut name_buf = [0u16; 512];
            let name_len =
                unsafe { K32GetModuleBaseNameW(self.handle, module, &mut name_buf) };
            let mut path_buf = [0u16; 1024];
            let path_len =
                unsafe { K32GetModuleFileNameExW(self.handle, module, &mut path_buf) };

            modules.push(ModuleInfo {
                name: String::from_utf16_lossy(&name_buf[..name_len as usize]),
                base: info.lpBaseOfDll as u64,
                size: info.SizeOfImage as u64,
                entry_point: info.EntryPoint as u64,
                path: String::from_utf16_lossy(&path_buf[..path_len as usize]),
            });
        }
        modules.sort_by_key(|m| m.base);
        modules
    }
}

/// Embedded-Authenticode oracle over WinVerifyTrust.
// TODO: catalog-signed system binaries currently classify as unsigned;
// wire in CryptCATAdminCalcHashFromFileHandle catalog lookup.
struct AuthenticodeOracle;

const GENERIC_VERIFY_V2: GUID = GUID::from_u128(0x00AAC56B_CD44_11d0_8CC2_00C04FC295EE);

impl SigningOracle for AuthenticodeOracle {
    fn classify(&self, path: &Path) -> SigningInfo {
        let wide: Vec<u16> = path
            .as_os_str()
            .to_string_lossy()
            .encode_utf16()
            .chain(std::iter::once(0))
            .collect();

        let mut file_info = WINTRUST_FILE_INFO {
            cbStruct: mem::size_of::<WINTRUST_FILE_INFO>() as u32,
            pcwszFilePath: PCWSTR(wide.as_ptr()),
            ..Default::default()
        };
        let mut data = WINTRUST_DATA {
            cbStruct: mem::size_of::<WINTRUST_DATA>() as u32,
            dwUIChoice: WTD_UI_NONE,
            fdwRevocationChecks: WTD_REVOKE_NONE,
            dwUnionChoice: WTD_CHOICE_FILE,
            Anonymous: WINTRUST_DATA_0 {
                pFile: &mut file_info,
            },
            dwStateAction: WTD_STATEACTION_VERIFY,
            ..Default::default()
        };

        let mut action = GENERIC_VERIFY_V2;
        let status = unsafe {
            WinVerifyTrust(
                HWND::default(),
                &mut action,
                &mut data as *mut WINTRUST_DATA as *mut c_void,
            )
        };
        data.dwStateAction = WTD_STATEACTION_CLOSE;
        unsafe {
            WinVerifyTrust(
                HWND::default(),
                &mut action,
                &mut data as *mut WINTRUST_DATA as *mut c_void,
            );
        }

        if status == 0 {
            SigningInfo {
                signed: true,
                kind: SigningKind::Embedded,
                level: SigningLevel::Authenticode,
            }
        } else {
            SigningInfo::unsigned()
        }
    }
}

fn wide_to_string(buffer: &[u16]) -> String {
    let end = buffer.iter().position(|&c| c == 0).unwrap_or(buffer.len());
    String::from_utf16_lossy(&buffer[..end])
}

fn last_error() -> i64 {
    unsafe { windows::Win32::Foundation::GetLastError().0 as i64 }
}
