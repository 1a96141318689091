//! Daemon configuration management

use anyhow::{Context, Result, anyhow};
use protocol::HEADER_SIZE;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub daemon: DaemonSettings,
    #[serde(default)]
    pub clients: ClientSettings,
    #[serde(default)]
    pub storage: StorageSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSettings {
    /// Path of the Unix socket clients connect to
    pub socket_path: PathBuf,
    pub log_level: String,
    /// Upper bound on one readiness wait, in milliseconds
    #[serde(default = "DaemonSettings::default_poll_timeout")]
    pub poll_timeout_ms: u64,
}

impl DaemonSettings {
    fn default_poll_timeout() -> u64 {
        100
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

/// Per-connection buffer sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Input buffer capacity; also the largest accepted message
    #[serde(default = "ClientSettings::default_input_buffer")]
    pub input_buffer_size: usize,
    /// Initial output buffer capacity
    #[serde(default = "ClientSettings::default_output_buffer")]
    pub output_buffer_size: usize,
    /// SO_SNDBUF / SO_RCVBUF applied to accepted sockets
    #[serde(default = "ClientSettings::default_socket_buffer")]
    pub socket_buffer_size: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            input_buffer_size: Self::default_input_buffer(),
            output_buffer_size: Self::default_output_buffer(),
            socket_buffer_size: Self::default_socket_buffer(),
        }
    }
}

impl ClientSettings {
    fn default_input_buffer() -> usize {
        0x10000
    }

    fn default_output_buffer() -> usize {
        0x10000
    }

    fn default_socket_buffer() -> usize {
        0x20000
    }
}

/// Where pairing records and the system BUID live
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    #[serde(default = "StorageSettings::default_dir")]
    pub config_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            config_dir: Self::default_dir(),
        }
    }
}

impl StorageSettings {
    fn default_dir() -> PathBuf {
        PathBuf::from("/var/lib/lockdown")
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            daemon: DaemonSettings {
                socket_path: PathBuf::from("/var/run/usbmuxd"),
                log_level: "info".to_string(),
                poll_timeout_ms: DaemonSettings::default_poll_timeout(),
            },
            clients: ClientSettings::default(),
            storage: StorageSettings::default(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usbmuxd/daemon.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let mut config: DaemonConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.expand_paths();
        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usbmuxd").join("daemon.toml")
        } else {
            PathBuf::from(".config/usbmuxd/daemon.toml")
        }
    }

    /// Expand `~` in configured paths
    fn expand_paths(&mut self) {
        self.daemon.socket_path = expand_tilde(&self.daemon.socket_path);
        self.storage.config_dir = expand_tilde(&self.storage.config_dir);
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.daemon.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.daemon.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.clients.input_buffer_size < HEADER_SIZE {
            return Err(anyhow!(
                "input_buffer_size {} cannot hold a {}-byte header",
                self.clients.input_buffer_size,
                HEADER_SIZE
            ));
        }

        if self.clients.output_buffer_size < HEADER_SIZE {
            return Err(anyhow!(
                "output_buffer_size {} cannot hold a {}-byte header",
                self.clients.output_buffer_size,
                HEADER_SIZE
            ));
        }

        if self.daemon.socket_path.as_os_str().is_empty() {
            return Err(anyhow!("socket_path must not be empty"));
        }

        Ok(())
    }
}

pub(crate) fn expand_tilde(path: &Path) -> PathBuf {
    match path.to_str() {
        Some(s) => PathBuf::from(shellexpand::tilde(s).as_ref()),
        None => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.daemon.socket_path, PathBuf::from("/var/run/usbmuxd"));
        assert_eq!(config.clients.input_buffer_size, 0x10000);
        assert_eq!(config.clients.socket_buffer_size, 0x20000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = DaemonConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: DaemonConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.daemon.log_level, parsed.daemon.log_level);
        assert_eq!(
            config.clients.output_buffer_size,
            parsed.clients.output_buffer_size
        );
    }

    #[test]
    fn test_optional_sections_default() {
        let parsed: DaemonConfig = toml::from_str(
            r#"
            [daemon]
            socket_path = "/tmp/usbmuxd.sock"
            log_level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.daemon.poll_timeout_ms, 100);
        assert_eq!(parsed.clients.input_buffer_size, 0x10000);
        assert_eq!(parsed.storage.config_dir, PathBuf::from("/var/lib/lockdown"));
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = DaemonConfig::default();
        config.daemon.log_level = "verbose".to_string();
        assert!(config.validate().is_err());

        config.daemon.log_level = "trace".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_buffer_sizes() {
        let mut config = DaemonConfig::default();
        config.clients.input_buffer_size = 8;
        assert!(config.validate().is_err());

        config.clients.input_buffer_size = HEADER_SIZE;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_and_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("daemon.toml");

        let mut config = DaemonConfig::default();
        config.daemon.log_level = "warn".to_string();
        config.save(&path).unwrap();

        let loaded = DaemonConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.daemon.log_level, "warn");
    }

    #[test]
    fn test_expand_tilde() {
        let expanded = expand_tilde(Path::new("~/lockdown"));
        assert!(!expanded.to_string_lossy().starts_with('~') || dirs::home_dir().is_none());
        assert_eq!(expand_tilde(Path::new("/abs/path")), PathBuf::from("/abs/path"));
    }
}
