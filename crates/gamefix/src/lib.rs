//! # gamefix
//!
//! Runtime for in-process game fixes built on `gamefix-core`.
//!
//! This crate provides:
//! - The [`Fix`] trait and a [`FixRegistry`] selecting a fix by executable name
//! - [`FixSession`], which scopes scans, patches and hooks to one module and
//!   isolates per-feature failures
//! - TOML configuration, file logging and a startup thread that waits for the
//!   game module before installing
//!
//! ```no_run
//! use std::sync::Arc;
//! use gamefix::prelude::*;
//! use gamefix::{ShutdownSignal, spawn_setup_thread};
//!
//! struct Widescreen;
//!
//! impl Fix for Widescreen {
//!     fn name(&self) -> &str {
//!         "widescreen"
//!     }
//!
//!     fn install(&self, session: &mut FixSession) -> Result<()> {
//!         let aspect = session.config().aspect_ratio();
//!         session.feature("aspect_ratio", |s| {
//!             let site = s.scan_first("F3 0F 10 05 ?? ?? ?? ?? F3 0F 11 43 ??")?;
//!             // SAFETY: the matched instruction loads the aspect ratio and is
//!             // only reached by the render thread after setup.
//!             unsafe {
//!                 s.hook(site, 8, move |ctx| ctx.xmm[0].set_f32(0, aspect))?;
//!             }
//!             Ok(())
//!         });
//!         Ok(())
//!     }
//! }
//!
//! let mut registry = FixRegistry::new();
//! registry.register_exe(&["Game.exe"], Widescreen);
//! let handle = spawn_setup_thread(registry, FixConfig::default(), Arc::new(ShutdownSignal::new()))?;
//! # drop(handle);
//! # Ok::<(), std::io::Error>(())
//! ```

pub mod config;
pub mod error;
pub mod fix;
pub mod logging;
pub mod prelude;
pub mod retry;
pub mod runtime;
pub mod session;
pub mod shared;
pub mod shutdown;

pub use config::{CONFIG_FILE_NAME, FixConfig, FixConfigBuilder, Resolution, StartupConfig};
pub use error::{Error, Result};
pub use fix::{Fix, FixRegistry};
pub use retry::{ExponentialBackoff, FixedDelay, NoRetry, RetryStrategy};
pub use runtime::{SETUP_THREAD_NAME, run_setup, spawn_setup_thread, wait_for_module};
pub use session::{FixSession, SessionReport};
pub use shared::SharedF32;
pub use shutdown::ShutdownSignal;
