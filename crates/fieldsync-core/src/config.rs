use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for the fieldsync queue and sync daemon
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Backend URL (if None, operations stay queued locally)
    pub server_url: Option<String>,

    /// API key sent with every backend request
    pub api_key: Option<String>,

    /// Storage bucket that receives job photos
    #[serde(default = "default_photo_bucket")]
    pub photo_bucket: String,

    /// Periodic drain interval in seconds
    #[serde(default = "default_sync_interval")]
    pub interval_seconds: u64,

    /// Failed attempts after which an operation needs user action
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,

    /// Reachability probe interval in seconds
    #[serde(default = "default_probe_interval")]
    pub probe_interval_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    /// Path to the local queue database
    pub database_path: Option<PathBuf>,
}

fn default_photo_bucket() -> String {
    "job-photos".to_string()
}

fn default_sync_interval() -> u64 {
    30 // 30 seconds
}

fn default_max_retries() -> u32 {
    3
}

fn default_request_timeout() -> u64 {
    30
}

fn default_probe_interval() -> u64 {
    15
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            server_url: None,
            api_key: None,
            photo_bucket: default_photo_bucket(),
            interval_seconds: default_sync_interval(),
            max_retries: default_max_retries(),
            request_timeout_seconds: default_request_timeout(),
            probe_interval_seconds: default_probe_interval(),
        }
    }
}

impl SyncSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds.max(1))
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_seconds.max(1))
    }
}

impl Config {
    /// Load configuration from the default location, creating it if missing
    pub fn load() -> Result<Self> {
        let config_path = Self::default_path()?;
        if !config_path.exists() {
            let default_config = Self::default();
            default_config.save_to(&config_path)?;
            return Ok(default_config);
        }
        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, toml_str)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// `FIELDSYNC_CONFIG` if set, otherwise ~/.config/fieldsync/config.toml
    pub fn default_path() -> Result<PathBuf> {
        if let Ok(custom_path) = std::env::var("FIELDSYNC_CONFIG") {
            return Ok(PathBuf::from(custom_path));
        }
        let home_dir = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home_dir.join(".config").join("fieldsync").join("config.toml"))
    }

    /// Get the queue database path, using default if not configured
    pub fn database_path(&self) -> Result<PathBuf> {
        if let Some(ref path) = self.storage.database_path {
            return Ok(path.clone());
        }
        let home_dir = dirs::home_dir().context("Cannot determine home directory")?;
        Ok(home_dir
            .join(".local")
            .join("share")
            .join("fieldsync")
            .join("queue.db"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_sections_use_defaults() {
        let config: Config = toml::from_str("[sync]\nserver_url = \"https://api.example.com\"\n").unwrap();
        assert_eq!(config.sync.server_url.as_deref(), Some("https://api.example.com"));
        assert_eq!(config.sync.max_retries, 3);
        assert_eq!(config.sync.interval_seconds, 30);
        assert_eq!(config.sync.photo_bucket, "job-photos");
        assert!(config.storage.database_path.is_none());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = Config::default();
        config.sync.max_retries = 5;
        config.storage.database_path = Some(dir.path().join("queue.db"));
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.sync.max_retries, 5);
        assert_eq!(loaded.database_path().unwrap(), dir.path().join("queue.db"));
    }

    #[test]
    fn test_zero_intervals_are_clamped() {
        let settings = SyncSettings {
            interval_seconds: 0,
            ..Default::default()
        };
        assert_eq!(settings.interval(), Duration::from_secs(1));
    }
}
