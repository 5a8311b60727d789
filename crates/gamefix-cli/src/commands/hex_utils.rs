//! Hex address parsing and formatting.

use anyhow::{Result, anyhow};

/// Parse an address with or without a `0x` prefix.
pub fn parse_hex_address(s: &str) -> Result<usize> {
    let digits = s
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    usize::from_str_radix(digits, 16).map_err(|e| anyhow!("Invalid hex address '{}': {}", s, e))
}

pub fn format_hex_address(addr: usize) -> String {
    format!("0x{:X}", addr)
}

/// Bytes at `offset..offset+len` as space-separated hex, clipped to `bytes`.
pub fn hex_bytes(bytes: &[u8], offset: usize, len: usize) -> String {
    let end = offset.saturating_add(len).min(bytes.len());
    bytes
        .get(offset..end)
        .unwrap_or_default()
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
