//! Loaded module lookup.

use std::ops::Range;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::image::ModuleImage;
use crate::platform;

/// A module mapped into the current process.
///
/// The record is a snapshot taken at lookup time. Unloading the module
/// afterwards leaves the record stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    name: String,
    path: PathBuf,
    base: usize,
    size: usize,
    spans: Vec<Range<usize>>,
}

impl Module {
    /// File name as reported by the loader, e.g. `game.exe`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
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

    /// Readable ranges inside the image.
    pub fn spans(&self) -> &[Range<usize>] {
        &self.spans
    }

    pub fn contains(&self, address: usize, len: usize) -> bool {
        address >= self.base
            && address
                .checked_add(len)
                .is_some_and(|end| end <= self.end())
    }

    /// View the readable parts of the module as a [`ModuleImage`].
    ///
    /// # Safety
    ///
    /// The module must stay loaded, and its readable spans readable, while
    /// the image is borrowed.
    pub unsafe fn image(&self) -> ModuleImage<'_> {
        // SAFETY: forwarded from the caller.
        unsafe { ModuleImage::from_raw_spans(self.base, self.size, &self.spans) }
    }
}

impl From<platform::LoadedModule> for Module {
    fn from(raw: platform::LoadedModule) -> Self {
        Self {
            name: raw.name,
            path: raw.path,
            base: raw.base,
            size: raw.size,
            spans: raw.spans,
        }
    }
}

/// Every module currently mapped, main program first.
pub fn loaded_modules() -> Vec<Module> {
    platform::loaded_modules()
        .into_iter()
        .map(Module::from)
        .collect()
}

/// Find a loaded module by file name, ignoring ASCII case.
///
/// Returns `None` when nothing matches; callers polling during startup
/// should treat that as "not loaded yet".
pub fn resolve(name: &str) -> Option<Module> {
    let found = platform::loaded_modules()
        .into_iter()
        .find(|module| module.name.eq_ignore_ascii_case(name))
        .map(Module::from);
    match &found {
        Some(module) => debug!(
            "Resolved {} at {:#x} (size {:#x})",
            module.name, module.base, module.size
        ),
        None => debug!("Module {} is not loaded", name),
    }
    found
}

/// The executable of the current process.
pub fn main_module() -> Option<Module> {
    platform::loaded_modules()
        .into_iter()
        .next()
        .map(Module::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::Pattern;
    use crate::scan::scan;

    static MARKER: [u8; 12] = [
        0x5A, 0xC3, 0x17, 0xE4, 0x9B, 0x02, 0x6D, 0xF0, 0x31, 0xA8, 0x44, 0xBE,
    ];

    fn exe_name() -> String {
        std::env::current_exe()
            .unwrap()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .into_owned()
    }

    #[test]
    fn test_resolve_missing_module() {
        assert!(resolve("missing.mod").is_none());
    }

    #[test]
    fn test_resolve_current_executable_ignores_case() {
        let module = resolve(&exe_name().to_uppercase()).unwrap();
        assert!(module.name().eq_ignore_ascii_case(&exe_name()));
        assert!(module.size() > 0);
        assert!(!module.spans().is_empty());
        assert_eq!(Some(module), main_module());
    }

    #[test]
    fn test_main_module_contains_own_statics() {
        let module = main_module().unwrap();
        assert!(module.contains(MARKER.as_ptr() as usize, MARKER.len()));
        assert!(module.contains(test_main_module_contains_own_statics as fn() as usize, 1));
    }

    #[test]
    fn test_scan_live_module_finds_static() {
        let module = main_module().unwrap();
        let pattern = Pattern::parse("5A C3 17 E4 ?? 02 6D F0 31 ?? 44 BE").unwrap();
        // SAFETY: the test binary stays loaded for the whole test.
        let image = unsafe { module.image() };
        let hits: Vec<usize> = scan(&image, &pattern)
            .into_iter()
            .map(|m| m.address)
            .collect();
        assert!(hits.contains(&(MARKER.as_ptr() as usize)));
    }
}
