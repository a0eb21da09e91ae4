//! Configuration loading
//!
//! Settings live in `~/.onionlink/config.toml`. A missing file is not an
//! error: every field has a default.

pub mod schema;

pub use schema::{
    AppConfig, ClientCookieConfig, Config, DnsConfig, HiddenServiceConfig, NetworkConfig,
    NotificationConfig, RelayConfig, TorConfig, UpstreamProxyConfig, UpstreamProxyType,
    VpnConfig,
};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::RwLock;

/// Live configuration shared between the controller, the orchestrator and
/// the command surface.
pub type SharedConfig = Arc<RwLock<Config>>;

/// Default config path: `~/.onionlink/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    directories::UserDirs::new().map(|dirs| dirs.home_dir().join(".onionlink").join("config.toml"))
}

impl Config {
    /// Parse a TOML document.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("Failed to parse config as TOML")
    }

    /// Load from `path`, falling back to defaults when the file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
        };
        Self::from_toml(&content).with_context(|| format!("Invalid config in {}", path.display()))
    }

    /// Write the config back out (write to `.tmp`, then rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self).context("Failed to serialize config")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, text.as_bytes())
            .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path).with_context(|| {
            format!("Failed to rename {} to {}", tmp_path.display(), path.display())
        })?;
        Ok(())
    }

    pub fn into_shared(self) -> SharedConfig {
        Arc::new(RwLock::new(self))
    }
}
