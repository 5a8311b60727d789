//! Executable memory owned by the engine.

use std::ptr::NonNull;

use tracing::debug;

use crate::error::{Error, Result};
use crate::platform;

/// A page-rounded block that is written while read-write, then sealed
/// read-execute. Released on drop.
#[derive(Debug)]
pub struct ExecutableBuffer {
    ptr: NonNull<u8>,
    len: usize,
    sealed: bool,
}

// SAFETY: the buffer exclusively owns its mapping.
unsafe impl Send for ExecutableBuffer {}
// SAFETY: shared access only reads the address and length.
unsafe impl Sync for ExecutableBuffer {}

fn round_up(len: usize, page: usize) -> Option<usize> {
    Some(len.max(1).checked_add(page - 1)? & !(page - 1))
}

/// Whether a `rel32` jump placed at `from` can reach `to`.
#[cfg(target_arch = "x86_64")]
pub(crate) fn rel32_reaches(from: usize, to: usize) -> bool {
    let delta = (to as i64).wrapping_sub(from as i64 + 5);
    i32::try_from(delta).is_ok()
}

impl ExecutableBuffer {
    /// Allocate anywhere in the address space.
    pub fn allocate(len: usize) -> Result<Self> {
        let len = round_up(len, platform::page_size())
            .ok_or_else(|| Error::AllocationFailed(format!("length {:#x} too large", len)))?;
        let ptr = platform::allocate(None, len)
            .ok_or_else(|| Error::AllocationFailed(format!("{:#x} bytes", len)))?;
        Ok(Self {
            ptr,
            len,
            sealed: false,
        })
    }

    /// Allocate within `rel32` reach of `target`.
    ///
    /// On 32-bit targets every address is reachable and this is the same as
    /// [`ExecutableBuffer::allocate`].
    pub fn allocate_near(target: usize, len: usize) -> Result<Self> {
        #[cfg(target_arch = "x86_64")]
        {
            Self::allocate_near_x64(target, len)
        }
        #[cfg(target_arch = "x86")]
        {
            let _ = target;
            Self::allocate(len)
        }
    }

    #[cfg(target_arch = "x86_64")]
    fn allocate_near_x64(target: usize, len: usize) -> Result<Self> {
        const MAX_DISTANCE: usize = 0x7FF0_0000;

        let len = round_up(len, platform::page_size())
            .ok_or_else(|| Error::AllocationFailed(format!("length {:#x} too large", len)))?;
        let reaches = |ptr: NonNull<u8>| {
            let start = ptr.as_ptr() as usize;
            rel32_reaches(target, start) && rel32_reaches(target, start + len)
        };
        let accept = |ptr: NonNull<u8>| Self {
            ptr,
            len,
            sealed: false,
        };

        // Fresh mappings often land next to existing ones.
        if let Some(ptr) = platform::allocate(None, len) {
            if reaches(ptr) {
                return Ok(accept(ptr));
            }
            // SAFETY: just allocated, never handed out.
            unsafe { platform::release(ptr, len) };
        }

        let granularity = platform::allocation_granularity();
        let origin = target & !(granularity - 1);
        let mut distance = granularity;
        while distance < MAX_DISTANCE {
            let candidates = [origin.checked_sub(distance), origin.checked_add(distance)];
            for candidate in candidates.into_iter().flatten() {
                let Some(ptr) = platform::allocate(Some(candidate), len) else {
                    continue;
                };
                if reaches(ptr) {
                    debug!(
                        "Allocated {:#x} bytes at {:#x} near {:#x}",
                        len,
                        ptr.as_ptr() as usize,
                        target
                    );
                    return Ok(accept(ptr));
                }
                // SAFETY: just allocated, never handed out.
                unsafe { platform::release(ptr, len) };
            }
            distance += granularity;
        }

        Err(Error::AllocationFailed(format!(
            "no free memory within 2GiB of {:#x}",
            target
        )))
    }

    pub fn address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Copy `bytes` to `offset`. Only allowed before [`ExecutableBuffer::seal`].
    pub fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        if self.sealed {
            return Err(Error::ProtectionChangeFailed {
                address: self.address() + offset,
                len: bytes.len(),
                message: "buffer is already sealed".to_string(),
            });
        }
        let end = offset.checked_add(bytes.len());
        if end.is_none_or(|end| end > self.len) {
            return Err(Error::OutOfBounds {
                address: self.address().wrapping_add(offset),
                len: bytes.len(),
            });
        }
        // SAFETY: in bounds of a read-write mapping we own.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.as_ptr().add(offset), bytes.len());
        }
        Ok(())
    }

    /// Switch the whole buffer to read-execute.
    pub fn seal(&mut self) -> Result<()> {
        if self.sealed {
            return Ok(());
        }
        // SAFETY: the mapping came from `platform::allocate` with this length.
        unsafe { platform::make_executable(self.ptr, self.len)? };
        self.sealed = true;
        Ok(())
    }
}

impl Drop for ExecutableBuffer {
    fn drop(&mut self) {
        // SAFETY: owned mapping, released exactly once.
        unsafe { platform::release(self.ptr, self.len) };
    }
}
