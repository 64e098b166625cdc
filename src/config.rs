//! Configuration management with validation and defaults
//!
//! Values come from an optional TOML file, then `DRAWGUARD_*` environment
//! overrides, then validation.

use crate::errors::{ConfigurationError, DrawGuardResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

/// Top-level service configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DrawGuardConfig {
    pub api: ApiConfig,
    pub storage: StorageConfig,
    pub queue: QueueConfig,
    pub monitor: MonitorConfig,
    pub security: SecurityConfig,
    pub logging: LoggingConfig,
}

/// HTTP surface configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
    pub request_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            allowed_origins: vec!["*".to_string()],
            request_timeout_secs: 30,
        }
    }
}

/// RocksDB location and write bounds
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_directory: String,
    pub write_buffer_size_mb: usize,
    /// Upper bound on the synchronous draw insert
    pub write_timeout_ms: u64,
    /// Upper bound on storage reads behind API queries
    pub read_timeout_ms: u64,
    /// How long a transaction waits on a row lock before giving up
    pub lock_timeout_ms: i64,
    pub max_transaction_retries: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_directory: "./DB/drawguard_data".to_string(),
            write_buffer_size_mb: 64,
            write_timeout_ms: 2_000,
            read_timeout_ms: 10_000,
            lock_timeout_ms: 1_000,
            max_transaction_retries: 8,
        }
    }
}

/// Background queue consumer settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Fallback poll interval when no enqueue notification arrives
    pub poll_interval_ms: u64,
    pub batch_size: usize,
    pub item_timeout_ms: u64,
    /// Delay before a failed item is retried
    pub retry_backoff_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            batch_size: 100,
            item_timeout_ms: 5_000,
            retry_backoff_ms: 1_000,
        }
    }
}

/// Sequence integrity and tamper detection schedule
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub gap_scan_interval_secs: u64,
    /// Number of most recent draws inspected per scan
    pub gap_scan_depth: usize,
    /// Trailing window for the gap alert query
    pub gap_window_secs: u64,
    pub tamper_check_interval_secs: u64,
    /// Missing draw numbers listed in a health row; the count is always exact
    pub missing_draws_limit: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            gap_scan_interval_secs: 10,
            gap_scan_depth: 100,
            gap_window_secs: 3_600,
            tamper_check_interval_secs: 30,
            missing_draws_limit: 100,
        }
    }
}

/// Access guard and forensic audit settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Prefix of the date-derived analytics key
    pub analytics_key_prefix: String,
    /// Server-side secret mixed into snapshot seals
    pub seal_key: String,
    /// JSON-lines audit file for forensic entries
    pub forensic_log_path: Option<String>,
    /// Path tokens that mark a request as an analytics mutation
    pub guarded_path_tokens: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            analytics_key_prefix: "SECURE_ANALYTICS_".to_string(),
            seal_key: "drawguard-local-seal".to_string(),
            forensic_log_path: Some("./logs/analytics_protection.log".to_string()),
            guarded_path_tokens: vec!["analytics".to_string(), "save_winning_number".to_string()],
        }
    }
}

/// Tracing subscriber settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub filter: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "drawguard=info,tower_http=info".to_string(),
            json: false,
        }
    }
}

impl DrawGuardConfig {
    /// Configuration for tests: short intervals, data under `data_directory`
    pub fn for_testing(data_directory: impl Into<String>) -> Self {
        Self {
            storage: StorageConfig {
                data_directory: data_directory.into(),
                write_timeout_ms: 5_000,
                ..Default::default()
            },
            queue: QueueConfig {
                poll_interval_ms: 20,
                retry_backoff_ms: 20,
                ..Default::default()
            },
            security: SecurityConfig {
                forensic_log_path: None,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.storage.write_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.storage.read_timeout_ms)
    }

    pub fn queue_poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue.poll_interval_ms)
    }

    pub fn queue_item_timeout(&self) -> Duration {
        Duration::from_millis(self.queue.item_timeout_ms)
    }

    pub fn queue_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.queue.retry_backoff_ms)
    }

    pub fn gap_scan_interval(&self) -> Duration {
        Duration::from_secs(self.monitor.gap_scan_interval_secs)
    }

    pub fn gap_window(&self) -> Duration {
        Duration::from_secs(self.monitor.gap_window_secs)
    }

    pub fn tamper_check_interval(&self) -> Duration {
        Duration::from_secs(self.monitor.tamper_check_interval_secs)
    }
}

/// Configuration loader with environment variable support
#[derive(Default)]
pub struct ConfigLoader {
    config_path: Option<String>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Set the configuration file path
    pub fn with_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Load configuration from file and environment variables
    pub fn load(&self) -> DrawGuardResult<DrawGuardConfig> {
        let mut config = match self.config_path {
            Some(ref path) => self.load_from_file(path)?,
            None => DrawGuardConfig::default(),
        };

        self.apply_env_overrides(&mut config)?;
        self.validate(&config)?;

        Ok(config)
    }

    fn load_from_file(&self, path: &str) -> DrawGuardResult<DrawGuardConfig> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigurationError::LoadFailed(format!("Failed to read {}: {}", path, e)))?;

        toml::from_str(&content)
            .map_err(|e| ConfigurationError::LoadFailed(format!("Failed to parse TOML: {}", e)).into())
    }

    fn apply_env_overrides(&self, config: &mut DrawGuardConfig) -> DrawGuardResult<()> {
        if let Ok(host) = env::var("DRAWGUARD_API_HOST") {
            config.api.host = host;
        }
        if let Ok(port) = env::var("DRAWGUARD_API_PORT") {
            config.api.port = parse_env("DRAWGUARD_API_PORT", port, "Invalid port number")?;
        }
        if let Ok(data_dir) = env::var("DRAWGUARD_DATA_DIR") {
            config.storage.data_directory = data_dir;
        }
        if let Ok(timeout) = env::var("DRAWGUARD_WRITE_TIMEOUT_MS") {
            config.storage.write_timeout_ms =
                parse_env("DRAWGUARD_WRITE_TIMEOUT_MS", timeout, "Invalid timeout value")?;
        }
        if let Ok(interval) = env::var("DRAWGUARD_GAP_SCAN_INTERVAL_SECS") {
            config.monitor.gap_scan_interval_secs =
                parse_env("DRAWGUARD_GAP_SCAN_INTERVAL_SECS", interval, "Invalid interval")?;
        }
        if let Ok(window) = env::var("DRAWGUARD_GAP_WINDOW_SECS") {
            config.monitor.gap_window_secs =
                parse_env("DRAWGUARD_GAP_WINDOW_SECS", window, "Invalid window")?;
        }
        if let Ok(interval) = env::var("DRAWGUARD_TAMPER_CHECK_INTERVAL_SECS") {
            config.monitor.tamper_check_interval_secs =
                parse_env("DRAWGUARD_TAMPER_CHECK_INTERVAL_SECS", interval, "Invalid interval")?;
        }
        if let Ok(prefix) = env::var("DRAWGUARD_ANALYTICS_KEY_PREFIX") {
            config.security.analytics_key_prefix = prefix;
        }
        if let Ok(seal_key) = env::var("DRAWGUARD_SEAL_KEY") {
            config.security.seal_key = seal_key;
        }
        if let Ok(filter) = env::var("DRAWGUARD_LOG") {
            config.logging.filter = filter;
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self, config: &DrawGuardConfig) -> DrawGuardResult<()> {
        if config.api.port == 0 {
            return Err(invalid("api.port", "0", "Port cannot be zero"));
        }
        if config.storage.data_directory.is_empty() {
            return Err(ConfigurationError::MissingRequired("storage.data_directory".to_string()).into());
        }
        if config.storage.write_timeout_ms == 0 {
            return Err(invalid("storage.write_timeout_ms", "0", "Write timeout cannot be zero"));
        }
        if config.storage.read_timeout_ms == 0 {
            return Err(invalid("storage.read_timeout_ms", "0", "Read timeout cannot be zero"));
        }
        if config.storage.max_transaction_retries == 0 {
            return Err(invalid("storage.max_transaction_retries", "0", "At least one attempt is required"));
        }
        if config.queue.batch_size == 0 {
            return Err(invalid("queue.batch_size", "0", "Batch size cannot be zero"));
        }
        if config.queue.item_timeout_ms == 0 {
            return Err(invalid("queue.item_timeout_ms", "0", "Item timeout cannot be zero"));
        }
        if config.monitor.gap_scan_interval_secs == 0 || config.monitor.tamper_check_interval_secs == 0 {
            return Err(invalid("monitor", "0", "Check intervals cannot be zero"));
        }
        if config.monitor.gap_scan_depth < 2 {
            return Err(invalid(
                "monitor.gap_scan_depth",
                &config.monitor.gap_scan_depth.to_string(),
                "At least two draws are needed to classify a transition",
            ));
        }
        if config.monitor.gap_window_secs == 0 || config.monitor.gap_window_secs > 86_400 {
            return Err(invalid(
                "monitor.gap_window_secs",
                &config.monitor.gap_window_secs.to_string(),
                "Window must be between 1s and 24h",
            ));
        }
        if config.security.analytics_key_prefix.is_empty() {
            return Err(ConfigurationError::MissingRequired("security.analytics_key_prefix".to_string()).into());
        }
        if config.security.seal_key.is_empty() {
            return Err(ConfigurationError::MissingRequired("security.seal_key".to_string()).into());
        }

        Ok(())
    }

    /// Save configuration to file
    pub fn save(&self, config: &DrawGuardConfig, path: &str) -> DrawGuardResult<()> {
        let toml_string = toml::to_string_pretty(config)
            .map_err(|e| ConfigurationError::SaveFailed(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, toml_string)
            .map_err(|e| ConfigurationError::SaveFailed(format!("Failed to write to {}: {}", path, e)).into())
    }
}

fn parse_env<T: std::str::FromStr>(field: &str, value: String, reason: &str) -> DrawGuardResult<T> {
    value.parse().map_err(|_| {
        ConfigurationError::InvalidValue {
            field: field.to_string(),
            value,
            reason: reason.to_string(),
        }
        .into()
    })
}

fn invalid(field: &str, value: &str, reason: &str) -> crate::errors::DrawGuardError {
    ConfigurationError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_is_valid() {
        let config = DrawGuardConfig::default();
        assert!(ConfigLoader::new().validate(&config).is_ok());
        assert_eq!(config.api.port, 8080);
        assert_eq!(config.monitor.gap_window_secs, 3_600);
    }

    #[test]
    fn test_config_validation() {
        let loader = ConfigLoader::new();
        let mut config = DrawGuardConfig::default();

        config.api.port = 0;
        assert!(loader.validate(&config).is_err());

        config.api.port = 9000;
        config.monitor.gap_scan_depth = 1;
        assert!(loader.validate(&config).is_err());

        config.monitor.gap_scan_depth = 50;
        config.security.analytics_key_prefix.clear();
        assert!(loader.validate(&config).is_err());
    }

    #[test]
    fn test_save_and_load_config() -> DrawGuardResult<()> {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();

        let mut original = DrawGuardConfig::default();
        original.api.port = 9191;
        original.monitor.gap_window_secs = 600;

        let loader = ConfigLoader::new();
        loader.save(&original, path)?;

        let loaded = ConfigLoader::new().with_path(path).load_from_file(path)?;
        assert_eq!(loaded.api.port, 9191);
        assert_eq!(loaded.monitor.gap_window_secs, 600);
        assert_eq!(loaded.security.analytics_key_prefix, "SECURE_ANALYTICS_");

        Ok(())
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let parsed: DrawGuardConfig = toml::from_str("[api]\nport = 7000\n").unwrap();
        assert_eq!(parsed.api.port, 7000);
        assert_eq!(parsed.api.host, "0.0.0.0");
        assert_eq!(parsed.queue.batch_size, 100);
    }

    #[test]
    fn test_duration_conversions() {
        let config = DrawGuardConfig::default();
        assert_eq!(config.write_timeout(), Duration::from_millis(2_000));
        assert_eq!(config.gap_window(), Duration::from_secs(3_600));
    }
}
