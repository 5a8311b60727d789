//! Writes into executable memory.
//!
//! Every write makes the covered pages writable, copies the bytes, restores
//! the previous protection and flushes the instruction cache. If protection
//! cannot be changed no byte is written.

use std::ops::Range;
use std::ptr;

use tracing::debug;

use crate::error::{Error, Result};
use crate::module::Module;
use crate::platform::{self, WritableRange};

/// Single-byte x86 no-op.
pub const NOP: u8 = 0x90;

/// What a write replaced, so it can be put back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchRecord {
    pub address: usize,
    pub original: Vec<u8>,
    pub patched: Vec<u8>,
}

impl PatchRecord {
    pub fn len(&self) -> usize {
        self.patched.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patched.is_empty()
    }

    /// Write the original bytes back.
    ///
    /// # Safety
    ///
    /// Same contract as [`CodeWriter::patch_bytes`].
    pub unsafe fn revert(&self) -> Result<()> {
        // SAFETY: forwarded from the caller.
        unsafe { write_code(self.address, &self.original)? };
        Ok(())
    }
}

/// Plain values that can be written as little-endian bytes.
pub trait PatchValue: Copy {
    fn to_patch_bytes(self) -> Vec<u8>;
}

macro_rules! impl_patch_value {
    ($($ty:ty),*) => {
        $(impl PatchValue for $ty {
            fn to_patch_bytes(self) -> Vec<u8> {
                self.to_le_bytes().to_vec()
            }
        })*
    };
}

impl_patch_value!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize, f32, f64);

/// Copies bytes into code, optionally restricted to one module.
#[derive(Debug, Clone, Default)]
pub struct CodeWriter {
    bounds: Option<Range<usize>>,
}

impl CodeWriter {
    /// A writer that accepts any address.
    pub fn new() -> Self {
        Self::default()
    }

    /// A writer that rejects ranges outside `module` with `OutOfBounds`.
    pub fn for_module(module: &Module) -> Self {
        Self {
            bounds: Some(module.base()..module.end()),
        }
    }

    fn check(&self, address: usize, len: usize) -> Result<()> {
        let Some(bounds) = &self.bounds else {
            return Ok(());
        };
        let inside = address >= bounds.start
            && address
                .checked_add(len)
                .is_some_and(|end| end <= bounds.end);
        if inside {
            Ok(())
        } else {
            Err(Error::OutOfBounds { address, len })
        }
    }

    /// Overwrite `bytes.len()` bytes at `address`.
    ///
    /// # Safety
    ///
    /// `address..address+bytes.len()` must be mapped memory of this process,
    /// and no thread may be executing the overwritten instructions.
    pub unsafe fn patch_bytes(&self, address: usize, bytes: &[u8]) -> Result<PatchRecord> {
        self.check(address, bytes.len())?;
        // SAFETY: forwarded from the caller.
        let original = unsafe { write_code(address, bytes)? };
        debug!("Patched {} byte(s) at {:#x}", bytes.len(), address);
        Ok(PatchRecord {
            address,
            original,
            patched: bytes.to_vec(),
        })
    }

    /// Overwrite `count` bytes at `address` with [`NOP`].
    ///
    /// # Safety
    ///
    /// Same contract as [`CodeWriter::patch_bytes`].
    pub unsafe fn write_nops(&self, address: usize, count: usize) -> Result<PatchRecord> {
        // SAFETY: forwarded from the caller.
        unsafe { self.patch_bytes(address, &vec![NOP; count]) }
    }

    /// Overwrite the bytes at `address` with `value`.
    ///
    /// # Safety
    ///
    /// Same contract as [`CodeWriter::patch_bytes`].
    pub unsafe fn write<T: PatchValue>(&self, address: usize, value: T) -> Result<PatchRecord> {
        // SAFETY: forwarded from the caller.
        unsafe { self.patch_bytes(address, &value.to_patch_bytes()) }
    }
}

/// Copy `bytes` to `address` under a [`WritableRange`] and return what was
/// there before.
///
/// # Safety
///
/// See [`CodeWriter::patch_bytes`].
pub(crate) unsafe fn write_code(address: usize, bytes: &[u8]) -> Result<Vec<u8>> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    // SAFETY: forwarded from the caller.
    let guard = unsafe { WritableRange::acquire(address, bytes.len())? };
    let mut original = vec![0u8; bytes.len()];
    // SAFETY: the range is mapped and readable while the guard lives.
    unsafe {
        ptr::copy_nonoverlapping(address as *const u8, original.as_mut_ptr(), bytes.len());
        ptr::copy_nonoverlapping(bytes.as_ptr(), address as *mut u8, bytes.len());
    }
    drop(guard);
    // SAFETY: the range was just written.
    unsafe { platform::flush_instruction_cache(address, bytes.len()) };
    Ok(original)
}
