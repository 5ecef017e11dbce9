use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Tunables read from `confd.toml` in the config root. Every field is
/// optional in the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    /// Seconds of inactivity before the saved-state append handle is closed
    pub append_idle_secs: u64,
    /// Seconds between client liveness sweeps
    pub sweep_interval_secs: u64,
    /// Seconds between background compactions of the saved-state log
    pub compact_interval_secs: u64,
    /// Exit after this many seconds with no clients and no listeners
    pub idle_exit_secs: Option<u64>,
    /// Timeout for a single call to a client or to the daemon, in milliseconds
    pub call_timeout_ms: u64,
    /// Extra discover/activate rounds when the daemon is mid-shutdown
    pub activation_retries: u32,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            append_idle_secs: 30,
            sweep_interval_secs: 60,
            compact_interval_secs: 60 * 60,
            idle_exit_secs: None,
            call_timeout_ms: 2_000,
            activation_retries: 1,
        }
    }
}

impl UserConfig {
    /// $CONFD_CONFIG_DIR/confd.toml or ~/.config/confd/confd.toml
    pub fn config_path() -> PathBuf {
        crate::clienv::config_dir().join("confd.toml")
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        tracing::trace!(path = %path.display(), "Loading confd config");

        if !path.exists() {
            tracing::trace!("Config file does not exist, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;

        tracing::trace!(config = ?config, "Config loaded");
        Ok(config)
    }

    pub fn append_idle(&self) -> Duration {
        Duration::from_secs(self.append_idle_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn compact_interval(&self) -> Duration {
        Duration::from_secs(self.compact_interval_secs)
    }

    pub fn idle_exit(&self) -> Option<Duration> {
        self.idle_exit_secs.map(Duration::from_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = UserConfig::load_from(&dir.path().join("confd.toml")).unwrap();
        assert_eq!(config, UserConfig::default());
        assert_eq!(config.append_idle(), Duration::from_secs(30));
        assert_eq!(config.activation_retries, 1);
    }

    #[test]
    fn partial_file_overrides_only_named_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("confd.toml");
        fs::write(&path, "idle_exit_secs = 600\nactivation_retries = 3\n").unwrap();

        let config = UserConfig::load_from(&path).unwrap();
        assert_eq!(config.idle_exit(), Some(Duration::from_secs(600)));
        assert_eq!(config.activation_retries, 3);
        assert_eq!(config.sweep_interval_secs, 60);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("confd.toml");
        fs::write(&path, "call_timeout_ms = \"soon\"").unwrap();
        assert!(UserConfig::load_from(&path).is_err());
    }
}
