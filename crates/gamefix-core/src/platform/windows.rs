use std::ffi::c_void;
use std::mem::size_of;
use std::ops::Range;
use std::path::PathBuf;
use std::ptr::NonNull;

use tracing::{debug, warn};
use windows::Win32::Foundation::CloseHandle;
use windows::Win32::System::Diagnostics::Debug::FlushInstructionCache;
use windows::Win32::System::Diagnostics::ToolHelp::{
    CREATE_TOOLHELP_SNAPSHOT_FLAGS, CreateToolhelp32Snapshot, MODULEENTRY32W, Module32FirstW,
    Module32NextW, TH32CS_SNAPMODULE, TH32CS_SNAPMODULE32,
};
use windows::Win32::System::Memory::{
    MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, MEMORY_BASIC_INFORMATION, PAGE_EXECUTE_READ,
    PAGE_EXECUTE_READWRITE, PAGE_GUARD, PAGE_NOACCESS, PAGE_PROTECTION_FLAGS, PAGE_READWRITE,
    VIRTUAL_ALLOCATION_TYPE, VirtualAlloc, VirtualFree, VirtualProtect, VirtualQuery,
};
use windows::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};
use windows::Win32::System::Threading::GetCurrentProcess;

use super::{LoadedModule, merge_spans};
use crate::error::{Error, Result};

pub(crate) struct SavedProtection {
    start: usize,
    len: usize,
    protect: PAGE_PROTECTION_FLAGS,
}

fn system_info() -> SYSTEM_INFO {
    let mut info = SYSTEM_INFO::default();
    // SAFETY: GetSystemInfo only fills the provided struct.
    unsafe { GetSystemInfo(&mut info) };
    info
}

pub(crate) fn page_size() -> usize {
    match system_info().dwPageSize as usize {
        0 => 0x1000,
        size => size,
    }
}

pub(crate) fn allocation_granularity() -> usize {
    match system_info().dwAllocationGranularity as usize {
        0 => 0x10000,
        size => size,
    }
}

fn query(address: usize) -> Option<MEMORY_BASIC_INFORMATION> {
    let mut info = MEMORY_BASIC_INFORMATION::default();
    // SAFETY: VirtualQuery only writes into `info`.
    let written = unsafe {
        VirtualQuery(
            Some(address as *const c_void),
            &mut info,
            size_of::<MEMORY_BASIC_INFORMATION>(),
        )
    };
    (written != 0).then_some(info)
}

fn wide_to_string(wide: &[u16]) -> String {
    let len = wide.iter().position(|&c| c == 0).unwrap_or(wide.len());
    String::from_utf16_lossy(&wide[..len])
}

/// Committed, readable regions of `base..base+size`.
fn readable_spans(base: usize, size: usize) -> Vec<Range<usize>> {
    let end = base.saturating_add(size);
    let mut spans = Vec::new();
    let mut cursor = base;
    while cursor < end {
        let Some(info) = query(cursor) else {
            break;
        };
        let region_end = (info.BaseAddress as usize).saturating_add(info.RegionSize);
        if region_end <= cursor {
            break;
        }
        let protect = info.Protect.0;
        let readable = info.State == MEM_COMMIT
            && protect != 0
            && protect & (PAGE_NOACCESS.0 | PAGE_GUARD.0) == 0;
        if readable {
            spans.push(cursor..region_end.min(end));
        }
        cursor = region_end;
    }
    merge_spans(spans)
}

pub(crate) fn loaded_modules() -> Vec<LoadedModule> {
    let flags = CREATE_TOOLHELP_SNAPSHOT_FLAGS(TH32CS_SNAPMODULE.0 | TH32CS_SNAPMODULE32.0);
    // SAFETY: snapshot of the current process; the handle is closed below.
    let snapshot = match unsafe { CreateToolhelp32Snapshot(flags, 0) } {
        Ok(handle) => handle,
        Err(e) => {
            debug!("CreateToolhelp32Snapshot failed: {}", e);
            return Vec::new();
        }
    };

    let mut entry = MODULEENTRY32W {
        dwSize: size_of::<MODULEENTRY32W>() as u32,
        ..Default::default()
    };
    let mut modules = Vec::new();
    // SAFETY: `entry` has dwSize set and lives across both calls.
    let mut more = unsafe { Module32FirstW(snapshot, &mut entry) }.is_ok();
    while more {
        let base = entry.modBaseAddr as usize;
        let size = entry.modBaseSize as usize;
        modules.push(LoadedModule {
            name: wide_to_string(&entry.szModule),
            path: PathBuf::from(wide_to_string(&entry.szExePath)),
            base,
            size,
            spans: readable_spans(base, size),
        });
        // SAFETY: as above.
        more = unsafe { Module32NextW(snapshot, &mut entry) }.is_ok();
    }

    // SAFETY: handle returned by CreateToolhelp32Snapshot.
    if let Err(e) = unsafe { CloseHandle(snapshot) } {
        debug!("CloseHandle failed: {}", e);
    }
    modules
}

/// # Safety
///
/// Changes protection of live pages.
pub(crate) unsafe fn make_writable(address: usize, len: usize) -> Result<Vec<SavedProtection>> {
    let failed = |message: String| Error::ProtectionChangeFailed {
        address,
        len,
        message,
    };
    let end = address
        .checked_add(len)
        .ok_or_else(|| failed("range overflows the address space".to_string()))?;

    let mut saved = Vec::new();
    let mut cursor = address;
    while cursor < end {
        let region_end = match query(cursor) {
            Some(info) if info.State == MEM_COMMIT => {
                (info.BaseAddress as usize + info.RegionSize).min(end)
            }
            _ => {
                // SAFETY: only undoes the changes made so far.
                unsafe { restore_protection(&saved) };
                return Err(failed(format!("{:#x} is not committed", cursor)));
            }
        };

        let mut old = PAGE_PROTECTION_FLAGS::default();
        // SAFETY: the region is committed; `old` receives the previous protection.
        let changed = unsafe {
            VirtualProtect(
                cursor as *const c_void,
                region_end - cursor,
                PAGE_EXECUTE_READWRITE,
                &mut old,
            )
        };
        if let Err(e) = changed {
            // SAFETY: only undoes the changes made so far.
            unsafe { restore_protection(&saved) };
            return Err(failed(e.to_string()));
        }
        saved.push(SavedProtection {
            start: cursor,
            len: region_end - cursor,
            protect: old,
        });
        cursor = region_end;
    }
    Ok(saved)
}

/// # Safety
///
/// `saved` must come from [`make_writable`].
pub(crate) unsafe fn restore_protection(saved: &[SavedProtection]) {
    for region in saved.iter().rev() {
        let mut scratch = PAGE_PROTECTION_FLAGS::default();
        // SAFETY: region was committed when it was saved.
        let restored = unsafe {
            VirtualProtect(
                region.start as *const c_void,
                region.len,
                region.protect,
                &mut scratch,
            )
        };
        if let Err(e) = restored {
            warn!("Failed to restore protection at {:#x}: {}", region.start, e);
        }
    }
}

/// Commit `len` bytes read-write, preferably at `hint`.
pub(crate) fn allocate(hint: Option<usize>, len: usize) -> Option<NonNull<u8>> {
    let kind = VIRTUAL_ALLOCATION_TYPE(MEM_COMMIT.0 | MEM_RESERVE.0);
    // SAFETY: a fresh allocation; fails with null if the hint is taken.
    let ptr = unsafe { VirtualAlloc(hint.map(|h| h as *const c_void), len, kind, PAGE_READWRITE) };
    NonNull::new(ptr.cast())
}

/// # Safety
///
/// `ptr..ptr+len` must come from [`allocate`].
pub(crate) unsafe fn make_executable(ptr: NonNull<u8>, len: usize) -> Result<()> {
    let mut old = PAGE_PROTECTION_FLAGS::default();
    // SAFETY: forwarded from the caller.
    unsafe { VirtualProtect(ptr.as_ptr() as *const c_void, len, PAGE_EXECUTE_READ, &mut old) }
        .map_err(|e| Error::ProtectionChangeFailed {
            address: ptr.as_ptr() as usize,
            len,
            message: e.to_string(),
        })?;
    // SAFETY: the range is ours and now executable.
    unsafe { flush_instruction_cache(ptr.as_ptr() as usize, len) };
    Ok(())
}

/// # Safety
///
/// `ptr` must come from [`allocate`] and not be used afterwards.
pub(crate) unsafe fn release(ptr: NonNull<u8>, _len: usize) {
    // SAFETY: forwarded from the caller.
    if let Err(e) = unsafe { VirtualFree(ptr.as_ptr().cast(), 0, MEM_RELEASE) } {
        warn!("VirtualFree({:#x}) failed: {}", ptr.as_ptr() as usize, e);
    }
}

/// # Safety
///
/// `address..address+len` should be mapped.
pub(crate) unsafe fn flush_instruction_cache(address: usize, len: usize) {
    // SAFETY: FlushInstructionCache tolerates any range of the current process.
    let flushed = unsafe {
        FlushInstructionCache(GetCurrentProcess(), Some(address as *const c_void), len)
    };
    if let Err(e) = flushed {
        debug!("FlushInstructionCache({:#x}) failed: {}", address, e);
    }
}
