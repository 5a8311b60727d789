//! OS-specific memory and loader primitives.
//!
//! Everything that touches page protection, the loader, or virtual memory
//! allocation lives behind this module. The rest of the crate only sees the
//! functions re-exported here.

#[cfg(not(any(target_os = "windows", target_os = "linux")))]
compile_error!("gamefix-core supports Windows and Linux hosts only");

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
compile_error!("gamefix-core supports x86 and x86_64 only");

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub(crate) use linux::*;

#[cfg(target_os = "windows")]
mod windows;
#[cfg(target_os = "windows")]
pub(crate) use windows::*;

use std::ops::Range;
use std::path::PathBuf;

use crate::error::Result;

/// Raw loader record before it becomes a [`crate::Module`].
#[derive(Debug)]
pub(crate) struct LoadedModule {
    pub name: String,
    pub path: PathBuf,
    pub base: usize,
    pub size: usize,
    pub spans: Vec<Range<usize>>,
}

/// Sort and coalesce touching or overlapping ranges.
pub(crate) fn merge_spans(mut spans: Vec<Range<usize>>) -> Vec<Range<usize>> {
    spans.sort_by_key(|span| span.start);
    let mut merged: Vec<Range<usize>> = Vec::with_capacity(spans.len());
    for span in spans {
        match merged.last_mut() {
            Some(last) if span.start <= last.end => last.end = last.end.max(span.end),
            _ => merged.push(span),
        }
    }
    merged
}

/// Keeps a range writable until dropped, then restores the previous
/// protection of every region it touched.
pub(crate) struct WritableRange {
    saved: Vec<SavedProtection>,
}

impl WritableRange {
    /// # Safety
    ///
    /// Making code writable is process-global; the caller is responsible for
    /// what gets written while the guard lives.
    pub(crate) unsafe fn acquire(address: usize, len: usize) -> Result<Self> {
        // SAFETY: forwarded from the caller.
        let saved = unsafe { make_writable(address, len)? };
        Ok(Self { saved })
    }
}

impl Drop for WritableRange {
    fn drop(&mut self) {
        // SAFETY: only restores protections captured by `make_writable`.
        unsafe { restore_protection(&self.saved) };
    }
}
