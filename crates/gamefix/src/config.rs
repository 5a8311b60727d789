//! Fix configuration loaded from a TOML file next to the game.
//!
//! ```toml
//! fov_scale = 1.25
//! log_level = "debug"
//!
//! [resolution]
//! width = 3440
//! height = 1440
//!
//! [features]
//! aspect_ratio = true
//! fov = false
//!
//! [startup]
//! poll_interval_ms = 250
//! max_attempts = 120
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::retry::FixedDelay;

/// Default file name, resolved next to the host executable.
pub const CONFIG_FILE_NAME: &str = "gamefix.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Default for Resolution {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
        }
    }
}

impl Resolution {
    pub fn aspect_ratio(&self) -> f32 {
        self.width as f32 / self.height as f32
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartupConfig {
    /// Delay between module lookups while the game is still loading.
    pub poll_interval_ms: u64,
    /// Lookups before giving up; at least one is always made.
    pub max_attempts: u32,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            max_attempts: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixConfig {
    pub resolution: Resolution,
    /// Multiplier applied on top of the aspect-corrected FOV.
    pub fov_scale: f32,
    /// Default tracing directive when `GAMEFIX_LOG` is unset.
    pub log_level: String,
    /// Per-feature switches; features not listed are enabled.
    pub features: BTreeMap<String, bool>,
    pub startup: StartupConfig,
}

impl Default for FixConfig {
    fn default() -> Self {
        Self {
            resolution: Resolution::default(),
            fov_scale: 1.0,
            log_level: "info".to_string(),
            features: BTreeMap::new(),
            startup: StartupConfig::default(),
        }
    }
}

impl FixConfig {
    /// Create a new configuration builder
    pub fn builder() -> FixConfigBuilder {
        FixConfigBuilder::default()
    }

    /// Load from `path`. A missing file yields the defaults; a malformed one
    /// is an error.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Config {} not found, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        let config = Self::from_toml_str(&content)?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.resolution.width == 0 || self.resolution.height == 0 {
            return Err(Error::ConfigError(format!(
                "resolution must be positive, got {}x{}",
                self.resolution.width, self.resolution.height
            )));
        }
        if !self.fov_scale.is_finite() || self.fov_scale <= 0.0 {
            return Err(Error::ConfigError(format!(
                "fov_scale must be a positive number, got {}",
                self.fov_scale
            )));
        }
        Ok(())
    }

    pub fn feature_enabled(&self, name: &str) -> bool {
        self.features.get(name).copied().unwrap_or(true)
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.resolution.aspect_ratio()
    }

    /// Module polling policy derived from `[startup]`.
    pub fn startup_retry(&self) -> FixedDelay {
        FixedDelay::new(
            Duration::from_millis(self.startup.poll_interval_ms),
            self.startup.max_attempts.saturating_sub(1),
        )
    }
}

/// Builder for FixConfig
#[derive(Debug, Clone, Default)]
pub struct FixConfigBuilder {
    resolution: Option<Resolution>,
    fov_scale: Option<f32>,
    log_level: Option<String>,
    features: BTreeMap<String, bool>,
    startup: Option<StartupConfig>,
}

impl FixConfigBuilder {
    pub fn resolution(mut self, width: u32, height: u32) -> Self {
        self.resolution = Some(Resolution { width, height });
        self
    }

    pub fn fov_scale(mut self, scale: f32) -> Self {
        self.fov_scale = Some(scale);
        self
    }

    pub fn log_level<S: Into<String>>(mut self, level: S) -> Self {
        self.log_level = Some(level.into());
        self
    }

    pub fn feature<S: Into<String>>(mut self, name: S, enabled: bool) -> Self {
        self.features.insert(name.into(), enabled);
        self
    }

    pub fn startup(mut self, poll_interval: Duration, max_attempts: u32) -> Self {
        self.startup = Some(StartupConfig {
            poll_interval_ms: poll_interval.as_millis() as u64,
            max_attempts,
        });
        self
    }

    /// Build the configuration
    pub fn build(self) -> FixConfig {
        let default = FixConfig::default();
        FixConfig {
            resolution: self.resolution.unwrap_or(default.resolution),
            fov_scale: self.fov_scale.unwrap_or(default.fov_scale),
            log_level: self.log_level.unwrap_or(default.log_level),
            features: self.features,
            startup: self.startup.unwrap_or(default.startup),
        }
    }
}
