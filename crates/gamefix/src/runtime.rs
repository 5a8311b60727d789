//! Startup: wait for the game module, pick a fix, install it.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use gamefix_core::{Module, main_module, resolve};
use tracing::{debug, error, info, warn};

use crate::config::FixConfig;
use crate::error::{Error, Result};
use crate::fix::FixRegistry;
use crate::retry::RetryStrategy;
use crate::session::{FixSession, SessionReport};
use crate::shutdown::ShutdownSignal;

/// Name of the thread started by [`spawn_setup_thread`].
pub const SETUP_THREAD_NAME: &str = "gamefix-setup";

/// Poll for `name` until it is loaded, the strategy gives up, or `shutdown`
/// fires.
pub fn wait_for_module(
    name: &str,
    strategy: &dyn RetryStrategy,
    shutdown: &ShutdownSignal,
) -> Result<Module> {
    let mut attempts = 0u32;
    loop {
        if shutdown.is_shutdown() {
            return Err(Error::Shutdown);
        }
        attempts += 1;
        if let Some(module) = resolve(name) {
            info!(
                "Module {} found at {:#x} after {} attempt(s)",
                module.name(),
                module.base(),
                attempts
            );
            return Ok(module);
        }
        let Some(delay) = strategy.next_delay(attempts) else {
            return Err(Error::ModuleTimeout {
                name: name.to_string(),
                attempts,
            });
        };
        debug!("Module {} not loaded yet, retrying in {:?}", name, delay);
        if shutdown.wait(delay) {
            return Err(Error::Shutdown);
        }
    }
}

/// Select the fix for the running executable and install it.
///
/// The returned session owns the installed hooks; call
/// [`FixSession::leak`] to keep them once setup is done. If the fix fails,
/// everything it installed is reverted before the error is returned.
pub fn run_setup(
    registry: &FixRegistry,
    config: Arc<FixConfig>,
    shutdown: &ShutdownSignal,
) -> Result<FixSession> {
    let exe = main_module().ok_or_else(|| gamefix_core::Error::ModuleNotFound("<main>".into()))?;
    info!("Host executable: {} ({})", exe.name(), exe.path().display());

    let fix = registry
        .select(exe.name())
        .ok_or_else(|| Error::NoMatchingFix(exe.name().to_string()))?;
    info!("Applying fix {}", fix.name());

    let module = match fix.target_module() {
        Some(name) if !name.eq_ignore_ascii_case(exe.name()) => {
            wait_for_module(name, &config.startup_retry(), shutdown)?
        }
        _ => exe,
    };

    // SAFETY: modules are only looked up, never unloaded, by the fix; the
    // game keeps its own images mapped for its lifetime.
    let mut session = unsafe { FixSession::new(module, config) };
    if let Err(e) = fix.install(&mut session) {
        if let Err(undo) = session.revert_all() {
            error!("Fix {} left partially applied: {}", fix.name(), undo);
        }
        return Err(e);
    }
    Ok(session)
}

/// Run [`run_setup`] on a dedicated thread and keep whatever it installs.
///
/// The thread yields the setup report, or `None` if setup failed or was
/// cancelled; failures are logged rather than propagated.
pub fn spawn_setup_thread(
    registry: FixRegistry,
    config: FixConfig,
    shutdown: Arc<ShutdownSignal>,
) -> io::Result<JoinHandle<Option<SessionReport>>> {
    let config = Arc::new(config);
    thread::Builder::new()
        .name(SETUP_THREAD_NAME.to_string())
        .spawn(move || match run_setup(&registry, config, &shutdown) {
            Ok(session) => {
                let report = session.report();
                info!(
                    "Setup finished for {}: {} feature(s) enabled, {} failed, {} patch(es), {} hook(s)",
                    report.module,
                    report.enabled.len(),
                    report.failed.len(),
                    report.patches,
                    report.hooks
                );
                session.leak();
                Some(report)
            }
            Err(Error::Shutdown) => {
                warn!("Setup cancelled by shutdown");
                None
            }
            Err(e) => {
                error!("Setup failed: {}", e);
                None
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fix::Fix;
    use crate::retry::{FixedDelay, NoRetry};
    use std::time::{Duration, Instant};

    struct TwoFeatures;

    impl Fix for TwoFeatures {
        fn name(&self) -> &str {
            "two_features"
        }

        fn install(&self, session: &mut FixSession) -> Result<()> {
            session.feature("always", |_| Ok(()));
            session.feature("never", |s| s.scan_first("C3 5A ?? 19 E2 71 0D 84 B6").map(|_| ()));
            Ok(())
        }
    }

    static mut ABANDONED_SITE: [u8; 6] = [0xD9, 0x05, 0x10, 0x20, 0x30, 0x40];

    struct FailsAfterPatching;

    impl Fix for FailsAfterPatching {
        fn name(&self) -> &str {
            "fails_after_patching"
        }

        fn install(&self, session: &mut FixSession) -> Result<()> {
            // SAFETY: the bytes are data, never executed.
            unsafe { session.nop(&raw const ABANDONED_SITE as usize, 6)? };
            Err(Error::ConfigError("unsupported game version".into()))
        }
    }

    fn catch_all() -> FixRegistry {
        let mut registry = FixRegistry::new();
        registry.register(|_| true, TwoFeatures);
        registry
    }

    #[test]
    fn test_wait_for_loaded_module_first_try() {
        let exe = main_module().unwrap();
        let module = wait_for_module(exe.name(), &NoRetry, &ShutdownSignal::new()).unwrap();
        assert_eq!(module.base(), exe.base());
    }

    #[test]
    fn test_wait_for_module_times_out() {
        let strategy = FixedDelay::new(Duration::from_millis(1), 2);
        let err = wait_for_module("never_loaded.mod", &strategy, &ShutdownSignal::new()).unwrap_err();
        assert!(matches!(err, Error::ModuleTimeout { attempts: 3, .. }));
    }

    #[test]
    fn test_wait_for_module_stops_on_shutdown() {
        let shutdown = Arc::new(ShutdownSignal::new());
        let trigger = {
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                shutdown.trigger();
            })
        };
        let start = Instant::now();
        let strategy = FixedDelay::new(Duration::from_secs(10), 100);
        let err = wait_for_module("never_loaded.mod", &strategy, &shutdown).unwrap_err();
        trigger.join().unwrap();
        assert!(matches!(err, Error::Shutdown));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_run_setup_without_matching_fix() {
        let registry = FixRegistry::new();
        let err = run_setup(&registry, Arc::new(FixConfig::default()), &ShutdownSignal::new())
            .unwrap_err();
        assert!(matches!(err, Error::NoMatchingFix(_)));
    }

    #[test]
    fn test_run_setup_reverts_failed_fix() {
        let mut registry = FixRegistry::new();
        registry.register(|_| true, FailsAfterPatching);
        let err = run_setup(&registry, Arc::new(FixConfig::default()), &ShutdownSignal::new())
            .unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));

        // SAFETY: only this test touches the static.
        let bytes = unsafe { std::ptr::read_volatile(&raw const ABANDONED_SITE) };
        assert_eq!(bytes, [0xD9, 0x05, 0x10, 0x20, 0x30, 0x40]);
    }

    #[test]
    fn test_setup_thread_reports_features() {
        let handle = spawn_setup_thread(
            catch_all(),
            FixConfig::default(),
            Arc::new(ShutdownSignal::new()),
        )
        .unwrap();
        let report = handle.join().unwrap().unwrap();
        assert_eq!(report.enabled, vec!["always".to_string()]);
        assert_eq!(report.failed, vec!["never".to_string()]);
        assert_eq!(report.hooks, 0);
    }

    #[test]
    fn test_setup_thread_returns_none_on_failure() {
        let handle = spawn_setup_thread(
            FixRegistry::new(),
            FixConfig::default(),
            Arc::new(ShutdownSignal::new()),
        )
        .unwrap();
        assert!(handle.join().unwrap().is_none());
    }
}
