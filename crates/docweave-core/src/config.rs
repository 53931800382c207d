//! Configuration schema (docweave.toml)

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Document store connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store type (only "memory" ships with docweave)
    #[serde(rename = "type", default = "default_store_kind")]
    pub kind: String,

    /// Database used when a model or collection does not name one
    #[serde(default = "default_database")]
    pub default_database: String,

    /// Connection settings (store-specific)
    #[serde(flatten)]
    pub settings: HashMap<String, String>,
}

fn default_store_kind() -> String {
    "memory".to_string()
}

fn default_database() -> String {
    "test".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: default_store_kind(),
            default_database: default_database(),
            settings: HashMap::new(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// How many models of one execution stage may run at once
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Project manifest, relative to the project root
    #[serde(default = "default_manifest")]
    pub manifest: PathBuf,

    /// Where `run` writes report.json (not written when absent)
    #[serde(default)]
    pub report: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set, e.g. "info" or "docweave_engine=debug"
    #[serde(default)]
    pub log_level: Option<String>,

    /// Store settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Project root path (for resolving relative paths)
    #[serde(skip)]
    pub project_root: PathBuf,
}

fn default_max_concurrency() -> usize {
    4
}

fn default_manifest() -> PathBuf {
    PathBuf::from("docweave.json")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            manifest: default_manifest(),
            report: None,
            log_level: None,
            store: StoreConfig::default(),
            project_root: std::env::current_dir().unwrap_or_default(),
        }
    }
}

impl Config {
    /// Load config from TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        let mut config = Self::from_toml(&contents)?;

        // Set project root to parent of config file
        if let Some(parent) = path.parent() {
            config.project_root = parent.to_path_buf();
        }

        Ok(config)
    }

    /// Load config from TOML string
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(toml)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        if config.max_concurrency == 0 {
            return Err(ConfigError::InvalidValue(
                "max_concurrency must be at least 1".to_string(),
            ));
        }

        Ok(config)
    }

    /// Save config to TOML file
    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let toml = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, toml)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Resolve a path relative to the project root
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_root.join(path)
        }
    }

    /// Absolute manifest path
    pub fn manifest_path(&self) -> PathBuf {
        self.resolve(&self.manifest)
    }
}

/// Config error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.manifest, PathBuf::from("docweave.json"));
        assert_eq!(config.store.kind, "memory");
        assert_eq!(config.store.default_database, "test");
    }

    #[test]
    fn parse_partial_toml() {
        let config = Config::from_toml(
            r#"
            max_concurrency = 8
            log_level = "debug"

            [store]
            default_database = "analytics"
            "#,
        )
        .unwrap();

        assert_eq!(config.max_concurrency, 8);
        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert_eq!(config.store.default_database, "analytics");
        assert_eq!(config.store.kind, "memory");
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let err = Config::from_toml("max_concurrency = 0").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }

    #[test]
    fn file_roundtrip_sets_project_root() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docweave.toml");

        let mut config = Config::default();
        config.max_concurrency = 2;
        config.save_to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.max_concurrency, 2);
        assert_eq!(loaded.project_root, dir.path());
        assert_eq!(loaded.manifest_path(), dir.path().join("docweave.json"));
    }
}
