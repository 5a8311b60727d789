//! Scan command implementation.

use std::path::Path;

use anyhow::{Result, bail};
use gamefix_core::{Match, ModuleImage, Pattern, scan, scan_first};
use owo_colors::OwoColorize;

use super::hex_utils::{format_hex_address, hex_bytes};
use super::read_image;

/// Matches of `pattern` in `bytes` mapped at `base`; at most one when `first`.
pub fn find(bytes: &[u8], base: usize, pattern: &Pattern, first: bool) -> Vec<Match> {
    let image = ModuleImage::from_slice(base, bytes);
    if first {
        scan_first(&image, pattern).into_iter().collect()
    } else {
        scan(&image, pattern)
    }
}

/// Run the scan command
pub fn run(file: &Path, pattern: &str, first: bool, base: usize, limit: usize) -> Result<()> {
    let pattern = Pattern::parse(pattern)?;
    let bytes = read_image(file)?;

    println!(
        "Scanning {} ({} bytes, base {}) for {}",
        file.display(),
        bytes.len(),
        format_hex_address(base),
        pattern.bold()
    );

    let matches = find(&bytes, base, &pattern, first);
    if matches.is_empty() {
        bail!("Pattern not found: {}", pattern);
    }

    for found in matches.iter().take(limit) {
        println!(
            "  {}  +{:<#10x} {}",
            format_hex_address(found.address).green(),
            found.offset,
            hex_bytes(&bytes, found.offset, pattern.len()).dimmed()
        );
    }
    if matches.len() > limit {
        println!("  ... {} more", matches.len() - limit);
    }
    println!();
    println!("{} match(es)", matches.len());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const IMAGE: [u8; 12] = [
        0x90, 0x48, 0x8B, 0x05, 0x10, 0x00, 0x48, 0x8B, 0x05, 0x20, 0x00, 0xC3,
    ];

    #[test]
    fn test_find_all_and_first() {
        let pattern = Pattern::parse("48 8B 05 ??").unwrap();
        let all = find(&IMAGE, 0x1000, &pattern, false);
        assert_eq!(
            all.iter().map(|m| m.address).collect::<Vec<_>>(),
            vec![0x1001, 0x1006]
        );
        let first = find(&IMAGE, 0x1000, &pattern, true);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].offset, 1);
    }

    #[test]
    fn test_run_reports_missing_pattern() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("image.bin");
        fs::write(&path, IMAGE).unwrap();

        assert!(run(&path, "48 8B 05", false, 0, 10).is_ok());
        assert!(run(&path, "CC CC", false, 0, 10).is_err());
        assert!(run(&path, "48 8B 0", false, 0, 10).is_err());
    }
}
