//! Runtime configuration, loaded from a platform-appropriate TOML file.
//!
//! ## Configuration file locations
//!
//! - Linux: `~/.config/clipbridge/config.toml`
//! - macOS: `~/Library/Application Support/com.clipbridge.Clipbridge/config.toml`
//! - Windows: `%APPDATA%\clipbridge\Clipbridge\config\config.toml`

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::checkpoint::RetryPolicy;
use crate::error::{Error, Result};

fn default_port() -> u16 {
    crate::DEFAULT_DATA_PORT
}

fn default_pairing_port() -> u16 {
    crate::DEFAULT_PAIRING_PORT
}

fn default_buffer_size() -> usize {
    64 * 1024
}

fn default_max_file_size() -> u64 {
    crate::DEFAULT_MAX_FILE_SIZE
}

fn default_max_total_size() -> u64 {
    crate::DEFAULT_MAX_TOTAL_SIZE
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_chunk_size() -> usize {
    crate::DEFAULT_CHUNK_SIZE
}

fn default_true() -> bool {
    true
}

fn default_temp_file_max_age_hours() -> u64 {
    1
}

fn default_chunk_timeout_secs() -> u64 {
    30
}

fn default_transfer_timeout_secs() -> u64 {
    600
}

fn default_device_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "clipbridge-device".to_string())
}

fn default_cleanup_max_age_secs() -> u64 {
    crate::DEFAULT_CLEANUP_MAX_AGE_SECS
}

fn default_sweep_interval_secs() -> u64 {
    crate::DEFAULT_SWEEP_INTERVAL_SECS
}

/// Chunk-retry tuning, as persisted in the config file. Converts to
/// [`RetryPolicy`] via [`RetryPolicyConfig::to_retry_policy`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    /// Maximum retries before a chunk is abandoned.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Delay ceiling, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Multiplier applied per retry attempt.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicyConfig {
    /// Convert to the runtime [`RetryPolicy`] used by the checkpoint store.
    #[must_use]
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
        }
    }
}

/// All configuration recognized by the sync engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data socket bind port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// One-shot pairing handshake port.
    #[serde(default = "default_pairing_port")]
    pub pairing_port: u16,
    /// Per-read socket buffer size, in bytes.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Per-file size ceiling, in bytes.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// Per-bundle size ceiling, in bytes.
    #[serde(default = "default_max_total_size")]
    pub max_total_size: u64,
    /// Clipboard adapter poll rate, in milliseconds. The engine itself does
    /// not poll the clipboard; this value is only carried through for the
    /// embedding application's external adapter.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Default chunk size for chunked file transfer, in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Static peer IP, when auto-discovery is not used. Resolved by an
    /// external peer resolver; the engine only consumes the result.
    #[serde(default)]
    pub peer_ip: Option<String>,
    /// Whether to prefer an external auto-discovery mechanism over
    /// `peer_ip`.
    #[serde(default)]
    pub use_auto_discovery: bool,
    /// Reject unauthenticated sessions when true.
    #[serde(default = "default_true")]
    pub require_pairing: bool,
    /// This device's self-reported name, used during pairing.
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// Receiver directory cleanup horizon, in hours.
    #[serde(default = "default_temp_file_max_age_hours")]
    pub temp_file_max_age_hours: u64,
    /// Chunk-retry tuning.
    #[serde(default)]
    pub retry_policy: RetryPolicyConfig,
    /// Per-chunk receive deadline, in seconds.
    #[serde(default = "default_chunk_timeout_secs")]
    pub chunk_timeout_secs: u64,
    /// Per-transfer wall-clock deadline, in seconds.
    #[serde(default = "default_transfer_timeout_secs")]
    pub transfer_timeout_secs: u64,
    /// Registry expiry sweep period, in seconds.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Horizon after which terminal registry/checkpoint records are
    /// purged, in seconds.
    #[serde(default = "default_cleanup_max_age_secs")]
    pub cleanup_max_age_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            pairing_port: default_pairing_port(),
            buffer_size: default_buffer_size(),
            max_file_size: default_max_file_size(),
            max_total_size: default_max_total_size(),
            poll_interval_ms: default_poll_interval_ms(),
            chunk_size: default_chunk_size(),
            peer_ip: None,
            use_auto_discovery: false,
            require_pairing: default_true(),
            device_name: default_device_name(),
            temp_file_max_age_hours: default_temp_file_max_age_hours(),
            retry_policy: RetryPolicyConfig::default(),
            chunk_timeout_secs: default_chunk_timeout_secs(),
            transfer_timeout_secs: default_transfer_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            cleanup_max_age_secs: default_cleanup_max_age_secs(),
        }
    }
}

impl Config {
    /// Load from the default platform config path, falling back to
    /// defaults if the file does not exist.
    pub async fn load() -> Result<Self> {
        let path = Self::config_path();
        Self::load_from(&path).await
    }

    /// Load from a specific path, falling back to defaults if it does not
    /// exist.
    pub async fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::ConfigError(format!("failed to read {}: {e}", path.display())))?;

        toml::from_str(&content)
            .map_err(|e| Error::ConfigError(format!("failed to parse {}: {e}", path.display())))
    }

    /// Save to the default platform config path.
    pub async fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()).await
    }

    /// Save to a specific path, creating parent directories as needed.
    pub async fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::ConfigError(format!("failed to create {}: {e}", parent.display())))?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::ConfigError(format!("failed to serialize config: {e}")))?;

        tokio::fs::write(path, content)
            .await
            .map_err(|e| Error::ConfigError(format!("failed to write {}: {e}", path.display())))
    }

    /// The platform-appropriate config directory.
    #[must_use]
    pub fn config_dir() -> PathBuf {
        directories::ProjectDirs::from("dev", "clipbridge", "Clipbridge").map_or_else(
            || PathBuf::from(".clipbridge"),
            |dirs| dirs.config_dir().to_path_buf(),
        )
    }

    /// The default config file path.
    #[must_use]
    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// The platform-appropriate data directory, used for the pairing file
    /// and checkpoint store.
    #[must_use]
    pub fn data_dir() -> PathBuf {
        directories::ProjectDirs::from("dev", "clipbridge", "Clipbridge").map_or_else(
            || PathBuf::from(".clipbridge"),
            |dirs| dirs.data_dir().to_path_buf(),
        )
    }

    /// Path to the persisted pairing state.
    #[must_use]
    pub fn pairing_path(&self) -> PathBuf {
        Self::data_dir().join("pairing.json")
    }

    /// Directory for the checkpoint store's JSON file.
    #[must_use]
    pub fn checkpoint_dir(&self) -> PathBuf {
        std::env::temp_dir().join("clipbridge").join("checkpoints")
    }

    /// Per-chunk receive deadline.
    #[must_use]
    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_timeout_secs)
    }

    /// Per-transfer wall-clock deadline.
    #[must_use]
    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.port, 9876);
        assert_eq!(config.pairing_port, 9877);
        assert!(config.require_pairing);
    }

    #[tokio::test]
    async fn test_config_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.port = 12345;
        config.device_name = "test-device".to_string();
        config.save_to(&path).await.unwrap();

        let loaded = Config::load_from(&path).await.unwrap();
        assert_eq!(loaded.port, 12345);
        assert_eq!(loaded.device_name, "test-device");
    }

    #[tokio::test]
    async fn test_config_missing_file_falls_back_to_default() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("does-not-exist.toml");

        let loaded = Config::load_from(&path).await.unwrap();
        assert_eq!(loaded.port, Config::default().port);
    }

    #[test]
    fn test_config_partial_deserialization_fills_defaults() {
        let partial = "port = 1234\n";
        let config: Config = toml::from_str(partial).unwrap();
        assert_eq!(config.port, 1234);
        assert_eq!(config.chunk_size, crate::DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_retry_policy_config_conversion() {
        let config = RetryPolicyConfig::default();
        let policy = config.to_retry_policy();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.initial_delay, Duration::from_secs(1));
    }
}
