//! CLI command implementations.
//!
//! Every command works on a file treated as a flat module image: a raw
//! memory dump or an executable read from disk. `--base` maps file offset 0
//! to the address the image had in the game.

pub mod hex_utils;
pub mod pointer;
pub mod scan;
pub mod signatures;

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};

/// Read `path` as image bytes.
pub fn read_image(path: &Path) -> Result<Vec<u8>> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    if bytes.is_empty() {
        bail!("{} is empty", path.display());
    }
    Ok(bytes)
}
