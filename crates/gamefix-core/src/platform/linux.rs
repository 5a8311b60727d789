use std::ffi::{CStr, c_int, c_void};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::ptr::NonNull;

use tracing::warn;

use super::{LoadedModule, merge_spans};
use crate::error::{Error, Result};

pub(crate) struct SavedProtection {
    start: usize,
    len: usize,
    prot: c_int,
}

pub(crate) fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as usize } else { 0x1000 }
}

pub(crate) fn allocation_granularity() -> usize {
    page_size()
}

pub(crate) fn loaded_modules() -> Vec<LoadedModule> {
    let mut modules: Vec<LoadedModule> = Vec::new();
    // SAFETY: the callback only reads the headers it is handed and pushes into
    // `modules`, which outlives the call.
    unsafe {
        libc::dl_iterate_phdr(
            Some(collect_module),
            (&mut modules as *mut Vec<LoadedModule>).cast(),
        );
    }
    modules
}

unsafe extern "C" fn collect_module(
    info: *mut libc::dl_phdr_info,
    _size: libc::size_t,
    data: *mut c_void,
) -> c_int {
    // SAFETY: `data` is the Vec passed by `loaded_modules`, `info` is valid for
    // the duration of the callback.
    let (modules, info) = unsafe { (&mut *data.cast::<Vec<LoadedModule>>(), &*info) };

    let path = if info.dlpi_name.is_null() {
        PathBuf::new()
    } else {
        // SAFETY: the loader hands out NUL-terminated names.
        let name = unsafe { CStr::from_ptr(info.dlpi_name) };
        PathBuf::from(name.to_string_lossy().into_owned())
    };
    // The main program is reported with an empty name.
    let path = if path.as_os_str().is_empty() && modules.is_empty() {
        std::env::current_exe().unwrap_or_default()
    } else {
        path
    };
    let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        return 0;
    };

    let headers = if info.dlpi_phdr.is_null() {
        &[][..]
    } else {
        // SAFETY: the loader reports `dlpi_phnum` program headers at `dlpi_phdr`.
        unsafe { std::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize) }
    };

    let load_bias = info.dlpi_addr as usize;
    let spans: Vec<_> = headers
        .iter()
        .filter(|header| {
            header.p_type == libc::PT_LOAD && header.p_flags & libc::PF_R != 0 && header.p_memsz > 0
        })
        .map(|header| {
            let start = load_bias.wrapping_add(header.p_vaddr as usize);
            start..start.wrapping_add(header.p_memsz as usize)
        })
        .collect();
    let spans = merge_spans(spans);

    let (Some(first), Some(last)) = (spans.first(), spans.last()) else {
        return 0;
    };
    let base = first.start;
    let size = last.end - base;
    modules.push(LoadedModule {
        name,
        path,
        base,
        size,
        spans,
    });
    0
}

fn parse_prot(perms: &str) -> c_int {
    let bytes = perms.as_bytes();
    let mut prot = libc::PROT_NONE;
    if bytes.first() == Some(&b'r') {
        prot |= libc::PROT_READ;
    }
    if bytes.get(1) == Some(&b'w') {
        prot |= libc::PROT_WRITE;
    }
    if bytes.get(2) == Some(&b'x') {
        prot |= libc::PROT_EXEC;
    }
    prot
}

/// Mappings intersecting `[start, end)`, clipped to it. Fails unless the
/// range is fully mapped.
fn mappings_covering(start: usize, end: usize) -> io::Result<Vec<(usize, usize, c_int)>> {
    let maps = fs::read_to_string("/proc/self/maps")?;
    let mut covering = Vec::new();
    for line in maps.lines() {
        let mut fields = line.split_whitespace();
        let (Some(range), Some(perms)) = (fields.next(), fields.next()) else {
            continue;
        };
        let Some((lo, hi)) = range.split_once('-') else {
            continue;
        };
        let (Ok(lo), Ok(hi)) = (usize::from_str_radix(lo, 16), usize::from_str_radix(hi, 16)) else {
            continue;
        };
        if hi <= start || lo >= end {
            continue;
        }
        covering.push((lo.max(start), hi.min(end), parse_prot(perms)));
    }

    let mut cursor = start;
    for &(lo, hi, _) in &covering {
        if lo != cursor {
            break;
        }
        cursor = hi;
    }
    if cursor != end {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{:#x} is not mapped", cursor),
        ));
    }
    Ok(covering)
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
    let page = page_size();
    let start = address & !(page - 1);
    let end = address
        .checked_add(len)
        .and_then(|end| end.checked_add(page - 1))
        .map(|end| end & !(page - 1))
        .ok_or_else(|| failed("range overflows the address space".to_string()))?;

    let mappings = mappings_covering(start, end).map_err(|e| failed(e.to_string()))?;

    let mut saved = Vec::new();
    for (lo, hi, prot) in mappings {
        if prot & libc::PROT_WRITE != 0 {
            continue;
        }
        // SAFETY: `lo..hi` is page aligned and mapped.
        let rc = unsafe {
            libc::mprotect(
                lo as *mut c_void,
                hi - lo,
                prot | libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if rc != 0 {
            let err = io::Error::last_os_error();
            // SAFETY: only undoes the changes made above.
            unsafe { restore_protection(&saved) };
            return Err(failed(err.to_string()));
        }
        saved.push(SavedProtection {
            start: lo,
            len: hi - lo,
            prot,
        });
    }
    Ok(saved)
}

/// # Safety
///
/// `saved` must come from [`make_writable`].
pub(crate) unsafe fn restore_protection(saved: &[SavedProtection]) {
    for region in saved.iter().rev() {
        // SAFETY: region was mapped when it was saved.
        let rc = unsafe { libc::mprotect(region.start as *mut c_void, region.len, region.prot) };
        if rc != 0 {
            warn!(
                "Failed to restore protection at {:#x}: {}",
                region.start,
                io::Error::last_os_error()
            );
        }
    }
}

/// Map `len` bytes read-write, preferably at `hint`.
pub(crate) fn allocate(hint: Option<usize>, len: usize) -> Option<NonNull<u8>> {
    // SAFETY: anonymous private mapping; a hint is only a suggestion.
    let ptr = unsafe {
        libc::mmap(
            hint.unwrap_or(0) as *mut c_void,
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        None
    } else {
        NonNull::new(ptr.cast())
    }
}

/// # Safety
///
/// `ptr..ptr+len` must come from [`allocate`].
pub(crate) unsafe fn make_executable(ptr: NonNull<u8>, len: usize) -> Result<()> {
    // SAFETY: forwarded from the caller.
    let rc = unsafe {
        libc::mprotect(
            ptr.as_ptr().cast(),
            len,
            libc::PROT_READ | libc::PROT_EXEC,
        )
    };
    if rc != 0 {
        return Err(Error::ProtectionChangeFailed {
            address: ptr.as_ptr() as usize,
            len,
            message: io::Error::last_os_error().to_string(),
        });
    }
    Ok(())
}

/// # Safety
///
/// `ptr..ptr+len` must come from [`allocate`] and not be used afterwards.
pub(crate) unsafe fn release(ptr: NonNull<u8>, len: usize) {
    // SAFETY: forwarded from the caller.
    if unsafe { libc::munmap(ptr.as_ptr().cast(), len) } != 0 {
        warn!(
            "munmap({:#x}, {:#x}) failed: {}",
            ptr.as_ptr() as usize,
            len,
            io::Error::last_os_error()
        );
    }
}

/// x86 keeps instruction fetch coherent with data writes.
pub(crate) unsafe fn flush_instruction_cache(_address: usize, _len: usize) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_prot() {
        assert_eq!(parse_prot("r-xp"), libc::PROT_READ | libc::PROT_EXEC);
        assert_eq!(parse_prot("rw-p"), libc::PROT_READ | libc::PROT_WRITE);
        assert_eq!(parse_prot("---p"), libc::PROT_NONE);
    }

    #[test]
    fn test_main_program_listed_first() {
        let modules = loaded_modules();
        let exe = std::env::current_exe().unwrap();
        let first = modules.first().unwrap();
        assert_eq!(first.path, exe);
        assert!(first.size > 0);
    }

    #[test]
    fn test_mappings_cover_allocation() {
        let len = page_size();
        let ptr = allocate(None, len).unwrap();
        let start = ptr.as_ptr() as usize;
        let mappings = mappings_covering(start, start + len).unwrap();
        assert_eq!(mappings.first().map(|m| m.0), Some(start));
        assert_eq!(mappings.last().map(|m| m.1), Some(start + len));
        // SAFETY: allocated above and unused afterwards.
        unsafe { release(ptr, len) };
    }
}
