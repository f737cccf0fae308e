//! Configuration System
//!
//! Handles loading configuration from TOML files and environment
//! variables. CLI flags (parsed in the binary) take precedence over both.

use crate::storage::StorageConfig;
use serde::Deserialize;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub sax: SaxConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Database location and durability settings
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    #[serde(default = "default_db_name")]
    pub db_name: String,

    #[serde(default = "default_ts_length")]
    pub ts_length: usize,

    #[serde(default = "default_flush_every")]
    pub flush_every: usize,
}

fn default_data_dir() -> String {
    "./vantage_data".to_string()
}

fn default_db_name() -> String {
    "default".to_string()
}

fn default_ts_length() -> usize {
    100
}

fn default_flush_every() -> usize {
    10
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            db_name: default_db_name(),
            ts_length: default_ts_length(),
            flush_every: default_flush_every(),
        }
    }
}

/// SAX parameters, fixed at database creation
#[derive(Debug, Clone, Deserialize)]
pub struct SaxConfig {
    #[serde(default = "default_word_length")]
    pub word_length: usize,

    #[serde(default = "default_cardinality")]
    pub cardinality: usize,

    #[serde(default = "default_threshold")]
    pub threshold: usize,
}

fn default_word_length() -> usize {
    4
}

fn default_cardinality() -> usize {
    4
}

fn default_threshold() -> usize {
    5
}

impl Default for SaxConfig {
    fn default() -> Self {
        Self {
            word_length: default_word_length(),
            cardinality: default_cardinality(),
            threshold: default_threshold(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;

        Ok(config)
    }

    /// Load configuration from a file with environment overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(data_dir) = std::env::var("VANTAGE_DATA_DIR") {
            self.database.data_dir = data_dir;
        }
        if let Ok(db_name) = std::env::var("VANTAGE_DB_NAME") {
            self.database.db_name = db_name;
        }
        if let Ok(ts_length) = std::env::var("VANTAGE_TS_LENGTH") {
            if let Ok(n) = ts_length.parse() {
                self.database.ts_length = n;
            }
        }
        if let Ok(flush_every) = std::env::var("VANTAGE_FLUSH_EVERY") {
            if let Ok(n) = flush_every.parse() {
                self.database.flush_every = n;
            }
        }
        if let Ok(level) = std::env::var("VANTAGE_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    /// The engine configuration this file describes.
    pub fn storage_config(&self) -> StorageConfig {
        let mut storage = StorageConfig::new(
            self.database.data_dir.clone(),
            self.database.db_name.clone(),
            self.database.ts_length,
        );
        storage.flush_every = self.database.flush_every;
        storage.word_length = self.sax.word_length;
        storage.cardinality = self.sax.cardinality;
        storage.threshold = self.sax.threshold;
        storage
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {error}")]
    Io { path: String, error: String },

    #[error("Failed to parse config file {path}: {error}")]
    Parse { path: String, error: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.database.ts_length, 100);
        assert_eq!(config.database.flush_every, 10);
        assert_eq!(config.sax.word_length, 4);
        assert_eq!(config.sax.cardinality, 4);
        assert_eq!(config.sax.threshold, 5);
    }

    #[test]
    fn test_parse_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[database]
data_dir = "/tmp/vantage"
db_name = "prices"
ts_length = 256
flush_every = 25

[sax]
word_length = 8
cardinality = 16
threshold = 10
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.database.db_name, "prices");
        assert_eq!(config.database.ts_length, 256);

        let storage = config.storage_config();
        assert_eq!(storage.flush_every, 25);
        assert_eq!(storage.word_length, 8);
        assert_eq!(storage.cardinality, 16);
        assert_eq!(storage.threshold, 10);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[database]\ndb_name = \"only\"\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.database.db_name, "only");
        assert_eq!(config.database.ts_length, 100);
        assert_eq!(config.sax.cardinality, 4);
    }

    #[test]
    fn test_bad_toml_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[[[ not toml").unwrap();
        assert!(matches!(
            Config::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
