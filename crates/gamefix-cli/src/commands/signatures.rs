//! Signatures command implementation.

use std::path::Path;

use anyhow::{Context, Result, bail};
use gamefix_core::{ModuleImage, SignatureSet, load_signatures};
use owo_colors::OwoColorize;

use super::hex_utils::format_hex_address;
use super::read_image;

/// One line of the report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub name: String,
    pub address: Option<usize>,
}

pub fn resolve(set: &SignatureSet, bytes: &[u8], base: usize) -> Vec<Resolved> {
    let image = ModuleImage::from_slice(base, bytes);
    set.signatures
        .iter()
        .zip(set.resolve_all(&image))
        .map(|(signature, address)| Resolved {
            name: signature.name.clone(),
            address,
        })
        .collect()
}

/// Run the signatures command
pub fn run(file: &Path, signatures: &Path, base: usize) -> Result<()> {
    let set = load_signatures(signatures)
        .with_context(|| format!("Failed to load {}", signatures.display()))?;
    if set.signatures.is_empty() {
        bail!("{} contains no signatures", signatures.display());
    }
    let bytes = read_image(file)?;

    if let Some(module) = &set.module {
        println!("Signature set for {}", module.bold());
    }

    let resolved = resolve(&set, &bytes, base);
    let width = resolved.iter().map(|r| r.name.len()).max().unwrap_or(0);
    for entry in &resolved {
        match entry.address {
            Some(address) => println!(
                "  {:<width$}  {}",
                entry.name,
                format_hex_address(address).green(),
                width = width
            ),
            None => println!(
                "  {:<width$}  {}",
                entry.name,
                "not found".red(),
                width = width
            ),
        }
    }

    let missing = resolved.iter().filter(|r| r.address.is_none()).count();
    println!();
    println!("{}/{} resolved", resolved.len() - missing, resolved.len());
    if missing > 0 {
        bail!("{} signature(s) unresolved", missing);
    }
    Ok(())
}
