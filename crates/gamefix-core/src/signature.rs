use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::error::{Error, Result};
use crate::image::ModuleImage;
use crate::pattern::Pattern;
use crate::pointer::PointerEncoding;
use crate::scan::scan_first;

/// A named pattern plus how to turn its first match into an address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeSignature {
    pub name: String,
    pub pattern: String,
    /// Offset from the match start to the instruction of interest.
    #[serde(default)]
    pub instr_offset: usize,
    /// Decode a pointer embedded in the instruction instead of returning its address.
    #[serde(default)]
    pub pointer: Option<PointerEncoding>,
    #[serde(default)]
    pub addend: i64,
}

impl CodeSignature {
    pub fn compile(&self) -> Result<Pattern> {
        Pattern::parse(&self.pattern)
    }

    pub fn resolve(&self, image: &ModuleImage<'_>) -> Result<usize> {
        let pattern = self.compile()?;
        let found = scan_first(image, &pattern)
            .ok_or_else(|| Error::PatternNotFound(format!("{} ({})", self.name, self.pattern)))?;
        let instruction = found.address.wrapping_add(self.instr_offset);
        let address = match self.pointer {
            Some(encoding) => encoding.resolve(image, instruction)?,
            None => instruction,
        };
        Ok(address.wrapping_add_signed(self.addend as isize))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignatureSet {
    #[serde(default)]
    pub module: Option<String>,
    pub signatures: Vec<CodeSignature>,
}

impl SignatureSet {
    pub fn get(&self, name: &str) -> Option<&CodeSignature> {
        self.signatures
            .iter()
            .find(|signature| signature.name.eq_ignore_ascii_case(name))
    }

    /// Resolve every signature; one slot per signature, `None` where it failed.
    pub fn resolve_all(&self, image: &ModuleImage<'_>) -> Vec<Option<usize>> {
        self.signatures
            .iter()
            .map(|signature| match signature.resolve(image) {
                Ok(address) => {
                    debug!("Signature {} resolved to {:#x}", signature.name, address);
                    Some(address)
                }
                Err(e) => {
                    debug!("Signature {} unresolved: {}", signature.name, e);
                    None
                }
            })
            .collect()
    }
}

pub fn load_signatures<P: AsRef<Path>>(path: P) -> Result<SignatureSet> {
    let content = fs::read_to_string(&path)?;
    let data = serde_json::from_str(&content)?;
    Ok(data)
}

pub fn save_signatures<P: AsRef<Path>>(path: P, signatures: &SignatureSet) -> Result<()> {
    let content = serde_json::to_string_pretty(signatures)?;
    fs::write(path, content)?;
    Ok(())
}
