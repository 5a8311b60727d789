//! File logging for fixes running inside the game process.

use std::env;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

use crate::config::FixConfig;
use crate::error::{Error, Result};

/// Environment variable holding a tracing directive that overrides
/// `log_level` from the config.
pub const LOG_ENV: &str = "GAMEFIX_LOG";

pub const LOG_FILE_NAME: &str = "gamefix.log";

/// `gamefix.log` in the host executable's directory.
pub fn log_path_next_to_exe() -> Result<PathBuf> {
    let exe = env::current_exe()?;
    let dir = exe
        .parent()
        .ok_or_else(|| Error::Logging(format!("{} has no parent directory", exe.display())))?;
    Ok(dir.join(LOG_FILE_NAME))
}

/// The directive to use: `env_value` when set and non-blank, otherwise the
/// config's `log_level`.
pub fn directive(config: &FixConfig, env_value: Option<&str>) -> String {
    match env_value.map(str::trim) {
        Some(value) if !value.is_empty() => value.to_string(),
        _ => config.log_level.clone(),
    }
}

/// Install a global subscriber appending to `path`.
///
/// Fails if the file cannot be opened, the directive is invalid, or a
/// subscriber is already installed.
pub fn init(config: &FixConfig, path: &Path) -> Result<()> {
    let env_value = env::var(LOG_ENV).ok();
    let filter = EnvFilter::try_new(directive(config, env_value.as_deref()))
        .map_err(|e| Error::Logging(e.to_string()))?;
    let file = OpenOptions::new().create(true).append(true).open(path)?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_thread_names(true)
        .with_writer(Mutex::new(file))
        .try_init()
        .map_err(|e| Error::Logging(e.to_string()))
}
