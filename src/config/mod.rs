//! Layered configuration for failcluster.
//!
//! Configuration is loaded with precedence: overrides > Env vars > Config file > Defaults
//!
//! # Example config file (failcluster.toml)
//! ```toml
//! [storage]
//! data_dir = "/var/lib/failcluster"
//!
//! [ingestion]
//! implicitly_exonerate_blocking_failures = true
//!
//! [reclustering]
//! batch_size = 500
//! max_concurrent_chunks = 4
//! ```
//!
//! Environment variables use the `FAILCLUSTER_` prefix with `__` between
//! section and key, e.g. `FAILCLUSTER_RECLUSTERING__BATCH_SIZE=200`.

mod defaults;

pub use defaults::*;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusteringConfig {
    /// RocksDB storage tuning
    pub storage: StorageConfig,
    /// Failure ingestion policy
    pub ingestion: IngestionConfig,
    /// Reclustering worker tuning
    pub reclustering: ReclusteringConfig,
    /// Ruleset caching
    pub rules: RulesConfig,
}

impl ClusteringConfig {
    /// Load configuration with precedence: overrides > Env > File > Defaults
    ///
    /// # Arguments
    /// * `config_path` - Optional path to TOML config file
    /// * `overrides` - Programmatic overrides to apply on top
    pub fn load(config_path: Option<&str>, overrides: ConfigOverrides) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(ClusteringConfig::default()));

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed("FAILCLUSTER_").split("__"));

        figment = figment.merge(Serialized::defaults(overrides));

        let config: Self = figment.extract().map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment and optional config file only (no overrides)
    pub fn from_env(config_path: Option<&str>) -> Result<Self, ConfigError> {
        Self::load(config_path, ConfigOverrides::default())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.reclustering.batch_size == 0 {
            return Err(ConfigError::new("reclustering.batch_size must be positive"));
        }
        if self.reclustering.max_concurrent_chunks == 0 {
            return Err(ConfigError::new("reclustering.max_concurrent_chunks must be positive"));
        }
        if self.reclustering.shard_count == 0 {
            return Err(ConfigError::new("reclustering.shard_count must be positive"));
        }
        if self.rules.cache_capacity == 0 {
            return Err(ConfigError::new("rules.cache_capacity must be positive"));
        }
        Ok(())
    }
}

/// RocksDB storage configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the database
    pub data_dir: PathBuf,
    /// Block cache size in MB
    pub block_cache_mb: usize,
    /// Write buffer size in MB
    pub write_buffer_mb: usize,
    /// Maximum number of background compaction jobs
    pub max_background_jobs: i32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            block_cache_mb: DEFAULT_BLOCK_CACHE_MB,
            write_buffer_mb: DEFAULT_WRITE_BUFFER_MB,
            max_background_jobs: DEFAULT_BACKGROUND_JOBS,
        }
    }
}

/// Failure ingestion policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    pub implicitly_exonerate_blocking_failures: bool,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            implicitly_exonerate_blocking_failures: DEFAULT_IMPLICITLY_EXONERATE_BLOCKING_FAILURES,
        }
    }
}

/// Reclustering worker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReclusteringConfig {
    /// State rows read per batch
    pub batch_size: usize,
    /// Chunks reclustered concurrently within a batch
    pub max_concurrent_chunks: usize,
    /// Shards per reclustering run
    pub shard_count: usize,
}

impl Default for ReclusteringConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_RECLUSTERING_BATCH_SIZE,
            max_concurrent_chunks: DEFAULT_MAX_CONCURRENT_CHUNKS,
            shard_count: DEFAULT_SHARD_COUNT,
        }
    }
}

/// Ruleset cache configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    /// Seconds before a cached ruleset is refetched
    pub refresh_interval_secs: u64,
    /// Projects held in the cache
    pub cache_capacity: usize,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: DEFAULT_RULES_REFRESH_INTERVAL_SECS,
            cache_capacity: DEFAULT_RULES_CACHE_CAPACITY,
        }
    }
}

/// Overrides that take precedence over file and env config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingestion: Option<IngestionOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reclustering: Option<ReclusteringOverrides>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub implicitly_exonerate_blocking_failures: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReclusteringOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent_chunks: Option<usize>,
}

/// Configuration error.
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl ConfigError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self {
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = ClusteringConfig::default();
        assert_eq!(config.storage.block_cache_mb, DEFAULT_BLOCK_CACHE_MB);
        assert!(!config.ingestion.implicitly_exonerate_blocking_failures);
        assert_eq!(config.reclustering.batch_size, DEFAULT_RECLUSTERING_BATCH_SIZE);
        assert_eq!(config.rules.cache_capacity, DEFAULT_RULES_CACHE_CAPACITY);
    }

    #[test]
    fn test_file_then_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[reclustering]\nbatch_size = 50\nmax_concurrent_chunks = 2\n\n[rules]\nrefresh_interval_secs = 5"
        )
        .unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let config = ClusteringConfig::from_env(Some(&path)).unwrap();
        assert_eq!(config.reclustering.batch_size, 50);
        assert_eq!(config.reclustering.max_concurrent_chunks, 2);
        assert_eq!(config.rules.refresh_interval_secs, 5);
        assert_eq!(config.storage, StorageConfig::default());

        let overrides = ConfigOverrides {
            reclustering: Some(ReclusteringOverrides {
                batch_size: Some(10),
                max_concurrent_chunks: None,
            }),
            ingestion: Some(IngestionOverrides {
                implicitly_exonerate_blocking_failures: Some(true),
            }),
            ..Default::default()
        };
        let config = ClusteringConfig::load(Some(&path), overrides).unwrap();
        assert_eq!(config.reclustering.batch_size, 10);
        assert_eq!(config.reclustering.max_concurrent_chunks, 2);
        assert!(config.ingestion.implicitly_exonerate_blocking_failures);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let overrides = ConfigOverrides {
            reclustering: Some(ReclusteringOverrides {
                batch_size: Some(0),
                max_concurrent_chunks: None,
            }),
            ..Default::default()
        };
        let err = ClusteringConfig::load(None, overrides).unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }
}
