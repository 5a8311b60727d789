//! Read-only views over a module's mapped bytes.

use std::ops::Range;

use crate::error::{Error, Result};

/// One contiguous readable run of the image.
#[derive(Debug, Clone, Copy)]
struct Span<'a> {
    address: usize,
    bytes: &'a [u8],
}

/// Borrowed bytes of a module, addressed by absolute virtual address.
///
/// An image is made of one or more readable spans. Gaps between spans (guard
/// pages, uncommitted sections) are never read. Images built with
/// [`ModuleImage::from_slice`] have a single span and can stand in for a live
/// module when working with a file on disk.
#[derive(Debug, Clone)]
pub struct ModuleImage<'a> {
    base: usize,
    size: usize,
    spans: Vec<Span<'a>>,
}

impl<'a> ModuleImage<'a> {
    /// Treat `bytes` as if they were mapped at `base`.
    pub fn from_slice(base: usize, bytes: &'a [u8]) -> Self {
        Self {
            base,
            size: bytes.len(),
            spans: vec![Span {
                address: base,
                bytes,
            }],
        }
    }

    /// Build an image over live memory.
    ///
    /// # Safety
    ///
    /// Every range in `spans` must be readable for the whole lifetime `'a`.
    pub unsafe fn from_raw_spans(base: usize, size: usize, spans: &[Range<usize>]) -> Self {
        let spans = spans
            .iter()
            .filter(|range| !range.is_empty())
            .map(|range| Span {
                address: range.start,
                // SAFETY: the caller guarantees the range stays mapped and readable for 'a.
                bytes: unsafe {
                    std::slice::from_raw_parts(range.start as *const u8, range.len())
                },
            })
            .collect();
        Self { base, size, spans }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn end(&self) -> usize {
        self.base.saturating_add(self.size)
    }

    /// Whether `[address, address + len)` lies within the image bounds.
    pub fn contains(&self, address: usize, len: usize) -> bool {
        address >= self.base
            && address
                .checked_add(len)
                .is_some_and(|end| end <= self.end())
    }

    /// Readable spans as `(address, bytes)` pairs in ascending order.
    pub fn spans(&self) -> impl Iterator<Item = (usize, &'a [u8])> + '_ {
        self.spans.iter().map(|span| (span.address, span.bytes))
    }

    /// Borrow `len` bytes at `address`; fails if they do not sit inside one
    /// readable span.
    pub fn read(&self, address: usize, len: usize) -> Result<&'a [u8]> {
        let out_of_bounds = || Error::OutOfBounds { address, len };
        let end = address.checked_add(len).ok_or_else(out_of_bounds)?;
        let span = self
            .spans
            .iter()
            .find(|span| address >= span.address && end <= span.address + span.bytes.len())
            .ok_or_else(out_of_bounds)?;
        let start = address - span.address;
        Ok(&span.bytes[start..start + len])
    }

    pub fn read_array<const N: usize>(&self, address: usize) -> Result<[u8; N]> {
        let bytes = self.read(address, N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    pub fn read_i32(&self, address: usize) -> Result<i32> {
        Ok(i32::from_le_bytes(self.read_array(address)?))
    }

    pub fn read_u32(&self, address: usize) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array(address)?))
    }

    /// Pointer-width little-endian value.
    pub fn read_usize(&self, address: usize) -> Result<usize> {
        Ok(usize::from_le_bytes(self.read_array(address)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_within_slice() {
        let data = [0x10, 0x20, 0x30, 0x40, 0x50];
        let image = ModuleImage::from_slice(0x1000, &data);
        assert_eq!(image.read(0x1001, 3).unwrap(), &[0x20, 0x30, 0x40]);
        assert_eq!(image.read_u32(0x1000).unwrap(), 0x4030_2010);
        assert_eq!(image.end(), 0x1005);
    }

    #[test]
    fn test_read_out_of_bounds() {
        let data = [0u8; 4];
        let image = ModuleImage::from_slice(0x1000, &data);
        assert!(matches!(
            image.read(0x1002, 4),
            Err(Error::OutOfBounds {
                address: 0x1002,
                len: 4
            })
        ));
        assert!(image.read(0x0FFF, 1).is_err());
        assert!(image.read(usize::MAX, 2).is_err());
    }

    #[test]
    fn test_contains() {
        let data = [0u8; 16];
        let image = ModuleImage::from_slice(0x4000, &data);
        assert!(image.contains(0x4000, 16));
        assert!(image.contains(0x400F, 1));
        assert!(!image.contains(0x400F, 2));
        assert!(!image.contains(0x3FFF, 1));
    }

    #[test]
    fn test_read_never_crosses_span_gap() {
        let first = [1u8; 8];
        let second = [2u8; 8];
        let spans = [
            first.as_ptr() as usize..first.as_ptr() as usize + first.len(),
            second.as_ptr() as usize..second.as_ptr() as usize + second.len(),
        ];
        // SAFETY: both arrays outlive the image.
        let image = unsafe { ModuleImage::from_raw_spans(spans[0].start, 16, &spans) };
        assert_eq!(image.read(spans[1].start + 4, 4).unwrap(), &[2, 2, 2, 2]);
        assert_eq!(image.spans().count(), 2);
    }
}
