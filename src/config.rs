//! Configuration for xrdp-local
//!
//! Loads configuration from TOML file at `~/.config/xrdp-local/config.toml`
//! Auto-generates default config file on first run if missing.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use xrdp_local_core::frame::FrameTransfer;
use xrdp_local_core::probe::CapabilityOverride;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub module: ModuleConfig,
    pub display: DisplayConfig,
    pub frames: FramesConfig,
    pub transport: TransportConfig,
    pub accel: AccelConfig,
    pub logging: LoggingConfig,
}

/// Where the config came from
#[derive(Debug)]
pub enum Origin {
    File(PathBuf),
    /// File was missing; defaults were written here
    Generated(PathBuf),
    /// File was missing and could not be written
    Defaults(PathBuf, String),
}

impl Config {
    /// Load configuration from `path` (or the default location). A missing
    /// file yields defaults and is created for next time.
    pub fn load(path: Option<&Path>) -> Result<(Self, Origin)> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };

        if !config_path.exists() {
            let origin = match Self::save_default(&config_path) {
                Ok(()) => Origin::Generated(config_path),
                Err(e) => Origin::Defaults(config_path, format!("{:#}", e)),
            };
            return Ok((Self::default(), origin));
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file {:?}", config_path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {:?}", config_path))?;

        Ok((config, Origin::File(config_path)))
    }

    /// Get the path to the config file
    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("xrdp-local");

        Ok(config_dir.join("config.toml"))
    }

    /// Save default configuration to file
    fn save_default(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let toml_string = toml::to_string_pretty(&Self::default())
            .context("Failed to serialize default config")?;

        fs::write(path, toml_string).context("Failed to write default config file")?;
        Ok(())
    }
}

/// Protocol module (libxup) location
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleConfig {
    pub path: PathBuf,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/usr/lib/x86_64-linux-gnu/xrdp/libxup.so"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Maximum monitors to hand to the session (0 = all)
    pub max_displays: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FramesConfig {
    /// "borrow": zero-copy, protocol thread waits for the render thread.
    /// "copy": frame is copied, protocol thread continues immediately.
    pub transfer: FrameTransfer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Sleep between transport polls (ms)
    pub poll_interval_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self { poll_interval_ms: 1 }
    }
}

impl TransportConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccelConfig {
    /// Allow the GPU buffer path at all
    pub enabled: bool,
    /// "auto" detects support in the loaded module
    pub capability: CapabilityOverride,
}

impl Default for AccelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capability: CapabilityOverride::Auto,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// tracing-subscriber filter directives; RUST_LOG takes precedence
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "xrdp_local=info,xrdp_local_core=info".into(),
        }
    }
}
