//! Per-fix state: the target module, config, and everything installed so far.

use std::sync::Arc;

use gamefix_core::{
    CodeWriter, HookId, HookManager, HookOptions, Module, ModuleImage, PatchRecord, PatchValue,
    Pattern, PointerEncoding, RegisterContext, scan, scan_first,
};
use tracing::{debug, error, info, warn};

use crate::config::FixConfig;
use crate::error::{Error, Result};

/// Summary of a finished setup, for logging and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub module: String,
    pub enabled: Vec<String>,
    pub failed: Vec<String>,
    pub patches: usize,
    pub hooks: usize,
}

/// Everything a [`crate::Fix`] needs while installing.
///
/// Writes and hooks are confined to the session's module. Hooks are removed
/// when the session is dropped unless [`FixSession::leak`] is called; byte
/// patches stay in place unless [`FixSession::revert_all`] is called.
#[derive(Debug)]
pub struct FixSession {
    module: Module,
    config: Arc<FixConfig>,
    writer: CodeWriter,
    hooks: HookManager,
    patches: Vec<PatchRecord>,
    enabled: Vec<String>,
    failed: Vec<String>,
}

impl FixSession {
    /// # Safety
    ///
    /// `module` must stay loaded for as long as the session exists.
    pub unsafe fn new(module: Module, config: Arc<FixConfig>) -> Self {
        Self {
            writer: CodeWriter::for_module(&module),
            module,
            config,
            hooks: HookManager::new(),
            patches: Vec::new(),
            enabled: Vec::new(),
            failed: Vec::new(),
        }
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn config(&self) -> &FixConfig {
        &self.config
    }

    /// Shared handle to the config, for moving into hook callbacks.
    pub fn config_handle(&self) -> Arc<FixConfig> {
        Arc::clone(&self.config)
    }

    pub fn image(&self) -> ModuleImage<'_> {
        // SAFETY: `new` requires the module to outlive the session.
        unsafe { self.module.image() }
    }

    /// Every address matching `pattern`, ascending.
    pub fn scan(&self, pattern: &str) -> Result<Vec<usize>> {
        let pattern = Pattern::parse(pattern)?;
        Ok(scan(&self.image(), &pattern)
            .into_iter()
            .map(|found| found.address)
            .collect())
    }

    /// Lowest address matching `pattern`; `PatternNotFound` if none.
    pub fn scan_first(&self, pattern: &str) -> Result<usize> {
        let parsed = Pattern::parse(pattern)?;
        let found = scan_first(&self.image(), &parsed)
            .ok_or_else(|| gamefix_core::Error::PatternNotFound(pattern.to_string()))?;
        debug!("{} found at {:#x} (+{:#x})", pattern, found.address, found.offset);
        Ok(found.address)
    }

    pub fn resolve_pointer(&self, instruction_address: usize, encoding: PointerEncoding) -> Result<usize> {
        Ok(self.image().resolve_pointer(instruction_address, encoding)?)
    }

    /// Whether `address..address+len` lies inside one readable span of the
    /// module, not just between its base and end.
    fn is_mapped(&self, address: usize, len: usize) -> bool {
        let Some(end) = address.checked_add(len) else {
            return false;
        };
        self.module
            .spans()
            .iter()
            .any(|span| span.start <= address && end <= span.end)
    }

    fn record(&mut self, record: PatchRecord) {
        self.patches.push(record);
    }

    /// # Safety
    ///
    /// No thread may be executing the overwritten instructions.
    pub unsafe fn patch(&mut self, address: usize, bytes: &[u8]) -> Result<()> {
        // SAFETY: the writer rejects ranges outside the module; the rest is
        // forwarded from the caller.
        let record = unsafe { self.writer.patch_bytes(address, bytes)? };
        self.record(record);
        Ok(())
    }

    /// # Safety
    ///
    /// See [`FixSession::patch`].
    pub unsafe fn nop(&mut self, address: usize, count: usize) -> Result<()> {
        // SAFETY: forwarded from the caller.
        let record = unsafe { self.writer.write_nops(address, count)? };
        self.record(record);
        Ok(())
    }

    /// # Safety
    ///
    /// See [`FixSession::patch`].
    pub unsafe fn write<T: PatchValue>(&mut self, address: usize, value: T) -> Result<()> {
        // SAFETY: forwarded from the caller.
        let record = unsafe { self.writer.write(address, value)? };
        self.record(record);
        Ok(())
    }

    /// # Safety
    ///
    /// Same contract as [`gamefix_core::Hook::install`].
    pub unsafe fn hook<F>(&mut self, address: usize, byte_count: usize, callback: F) -> Result<HookId>
    where
        F: Fn(&mut RegisterContext) + Send + Sync + 'static,
    {
        // SAFETY: forwarded from the caller.
        unsafe { self.hook_with(address, byte_count, HookOptions::default(), callback) }
    }

    /// # Safety
    ///
    /// Same contract as [`gamefix_core::Hook::install`].
    pub unsafe fn hook_with<F>(
        &mut self,
        address: usize,
        byte_count: usize,
        options: HookOptions,
        callback: F,
    ) -> Result<HookId>
    where
        F: Fn(&mut RegisterContext) + Send + Sync + 'static,
    {
        if !self.is_mapped(address, byte_count) {
            return Err(gamefix_core::Error::OutOfBounds {
                address,
                len: byte_count,
            }
            .into());
        }
        // SAFETY: forwarded from the caller.
        Ok(unsafe { self.hooks.install_with(address, byte_count, options, callback)? })
    }

    /// Run one named feature.
    ///
    /// Skipped when disabled in `[features]`. On failure, the hooks and
    /// patches the feature installed before failing are undone, newest
    /// first, and the failure is logged and recorded; the session stays
    /// usable for the remaining features. Returns whether the feature is now
    /// active.
    pub fn feature<F>(&mut self, name: &str, install: F) -> bool
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        if !self.config.feature_enabled(name) {
            info!("Feature {} disabled in config", name);
            return false;
        }
        let (patch_mark, hook_mark) = (self.patches.len(), self.hooks.len());
        match install(self) {
            Ok(()) => {
                info!("Feature {} enabled", name);
                self.enabled.push(name.to_string());
                true
            }
            Err(e) => {
                warn!("Feature {} skipped: {}", name, e);
                if let Err(undo) = self.rollback_to(patch_mark, hook_mark) {
                    error!("Feature {} left partially applied: {}", name, undo);
                }
                self.failed.push(name.to_string());
                false
            }
        }
    }

    pub fn patches(&self) -> &[PatchRecord] {
        &self.patches
    }

    pub fn hooks(&self) -> &HookManager {
        &self.hooks
    }

    pub fn failed_features(&self) -> &[String] {
        &self.failed
    }

    pub fn report(&self) -> SessionReport {
        SessionReport {
            module: self.module.name().to_string(),
            enabled: self.enabled.clone(),
            failed: self.failed.clone(),
            patches: self.patches.len(),
            hooks: self.hooks.installed_count(),
        }
    }

    /// Remove every hook, then undo byte patches newest first.
    ///
    /// No thread may be executing patched or hooked code.
    pub fn revert_all(&mut self) -> Result<()> {
        self.rollback_to(0, 0)
    }

    /// Drop hooks past the first `hooks` and revert patches past the first
    /// `patches`, newest first. Hooks go first since they usually sit on
    /// top of patched bytes.
    fn rollback_to(&mut self, patches: usize, hooks: usize) -> Result<()> {
        let removed = self.hooks.truncate(hooks);
        while self.patches.len() > patches {
            let Some(record) = self.patches.pop() else {
                break;
            };
            // SAFETY: the record was written by this session into its module.
            if let Err(e) = unsafe { record.revert() } {
                self.patches.push(record);
                return Err(Error::from(e));
            }
        }
        Ok(removed?)
    }

    /// Keep hooks and patches for the rest of the process lifetime.
    pub fn leak(mut self) {
        self.hooks.leak_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gamefix_core::main_module;

    fn session(config: FixConfig) -> FixSession {
        let module = main_module().unwrap();
        // SAFETY: the test binary stays loaded.
        unsafe { FixSession::new(module, Arc::new(config)) }
    }

    #[test]
    fn test_feature_success_and_failure() {
        let mut session = session(FixConfig::default());
        assert!(session.feature("ok", |_| Ok(())));
        assert!(!session.feature("missing_pattern", |s| {
            s.scan_first("DE AD BE EF DE AD BE EF 13 37 C0 DE ?? 00 FF")?;
            Ok(())
        }));
        let report = session.report();
        assert_eq!(report.enabled, vec!["ok".to_string()]);
        assert_eq!(report.failed, vec!["missing_pattern".to_string()]);
        assert_eq!(session.failed_features(), &["missing_pattern".to_string()]);
    }

    #[test]
    fn test_disabled_feature_not_run() {
        let config = FixConfig::builder().feature("fov", false).build();
        let mut session = session(config);
        let mut ran = false;
        assert!(!session.feature("fov", |_| {
            ran = true;
            Ok(())
        }));
        assert!(!ran);
        assert!(session.report().failed.is_empty());
    }

    #[test]
    fn test_invalid_pattern_is_error() {
        let session = session(FixConfig::default());
        assert!(matches!(
            session.scan("XYZ"),
            Err(Error::Core(gamefix_core::Error::InvalidPattern(_)))
        ));
    }

    #[test]
    fn test_writes_outside_module_rejected() {
        let mut session = session(FixConfig::default());
        let outside = session.module().end() + 0x1000;
        // SAFETY: rejected before touching memory.
        let patched = unsafe { session.patch(outside, &[0x90]) };
        assert!(matches!(
            patched,
            Err(Error::Core(gamefix_core::Error::OutOfBounds { .. }))
        ));
        // SAFETY: rejected before touching memory.
        let hooked = unsafe { session.hook(outside, 5, |_| {}) };
        assert!(hooked.is_err());
        assert!(session.patches().is_empty());
    }

    // mov eax, [ebp+8]; fld dword [eax+0x1C]; pop ebp; ret
    const SITE_CODE: [u8; 8] = [0x8B, 0x45, 0x08, 0xD9, 0x40, 0x1C, 0x5D, 0xC3];

    static mut NOP_THEN_SHORT_HOOK: [u8; 8] = SITE_CODE;
    static mut NOP_THEN_HOOK: [u8; 8] = SITE_CODE;

    fn read_site(site: *const [u8; 8]) -> [u8; 8] {
        // SAFETY: the statics are only modified through the session's writer.
        unsafe { std::ptr::read_volatile(site) }
    }

    #[test]
    fn test_failed_feature_reverts_its_patches() {
        let site = &raw const NOP_THEN_SHORT_HOOK;
        let address = site as usize;
        let mut session = session(FixConfig::default());

        let enabled = session.feature("nop_then_hook", |s| {
            // SAFETY: the bytes are data, never executed.
            unsafe {
                s.nop(address, 6)?;
                s.hook(address, 4, |_| {})?;
            }
            Ok(())
        });

        assert!(!enabled);
        assert_eq!(read_site(site), SITE_CODE);
        assert!(session.patches().is_empty());
        assert_eq!(session.failed_features(), &["nop_then_hook".to_string()]);
    }

    #[test]
    fn test_failed_feature_removes_its_hooks() {
        let site = &raw const NOP_THEN_HOOK;
        let address = site as usize;
        let mut session = session(FixConfig::default());

        let enabled = session.feature("hook_then_fail", |s| {
            // SAFETY: the hook is installed but the bytes are never executed.
            unsafe {
                s.nop(address, 6)?;
                s.hook(address, 6, |_| {})?;
            }
            assert_ne!(read_site(site)[..6], SITE_CODE[..6]);
            Err(Error::ConfigError("later step failed".into()))
        });

        assert!(!enabled);
        assert_eq!(read_site(site), SITE_CODE);
        assert!(session.hooks().is_empty());
        assert!(session.patches().is_empty());
    }

    #[test]
    fn test_hook_in_module_gap_rejected() {
        let mut session = session(FixConfig::default());
        let module = session.module().clone();
        let gap = module
            .spans()
            .windows(2)
            .find(|pair| pair[0].end < pair[1].start)
            .map(|pair| pair[0].end);
        if let Some(gap) = gap {
            // SAFETY: rejected before touching memory.
            let hooked = unsafe { session.hook(gap, 5, |_| {}) };
            assert!(matches!(
                hooked,
                Err(Error::Core(gamefix_core::Error::OutOfBounds { .. }))
            ));
        }
    }

    #[test]
    fn test_scan_finds_static_in_module() {
        static MARKER: [u8; 10] = [0x3C, 0x91, 0xEE, 0x07, 0x58, 0xA2, 0x1D, 0xF9, 0x66, 0x0B];
        let session = session(FixConfig::default());
        let hits = session.scan("3C 91 EE 07 ?? A2 1D F9 66 0B").unwrap();
        assert!(hits.contains(&(MARKER.as_ptr() as usize)));
    }
}
