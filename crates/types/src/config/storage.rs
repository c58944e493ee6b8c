//! Bucket setup and data migration configuration.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{BackoffConfig, ConfigError};

/// Default number of objects reindexed per reindex RPC.
const fn default_reindex_batch_size() -> u32 {
    100
}

/// Default number of records migrated per chunk.
///
/// Matches the store's default page size for `find_objects`.
const fn default_chunk_size() -> usize {
    1000
}

/// Configuration for bucket setup and reindexing at startup.
///
/// # Example
///
/// ```no_run
/// # use vm_inventory_types::config::{BackoffConfig, BucketSetupConfig};
/// let config = BucketSetupConfig::builder()
///     .setup_backoff(BackoffConfig::builder().max_attempts(20).build().expect("backoff"))
///     .reindex_batch_size(500)
///     .build()
///     .expect("valid bucket setup config");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BucketSetupConfig {
    /// Backoff applied to the setup phase (create/update buckets).
    #[serde(default)]
    pub setup_backoff: BackoffConfig,
    /// Backoff applied to the reindex phase.
    #[serde(default)]
    pub reindex_backoff: BackoffConfig,
    /// Objects reindexed per reindex RPC.
    #[serde(default = "default_reindex_batch_size")]
    pub reindex_batch_size: u32,
}

#[bon::bon]
impl BucketSetupConfig {
    /// Creates a new bucket setup configuration with validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    #[builder]
    pub fn new(
        #[builder(default)] setup_backoff: BackoffConfig,
        #[builder(default)] reindex_backoff: BackoffConfig,
        #[builder(default = default_reindex_batch_size())] reindex_batch_size: u32,
    ) -> Result<Self, ConfigError> {
        let config = Self { setup_backoff, reindex_backoff, reindex_batch_size };
        config.validate()?;
        Ok(config)
    }
}

impl BucketSetupConfig {
    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.setup_backoff.validate()?;
        self.reindex_backoff.validate()?;
        if self.reindex_batch_size == 0 {
            return Err(ConfigError::Validation {
                message: "reindex_batch_size must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for BucketSetupConfig {
    fn default() -> Self {
        Self {
            setup_backoff: BackoffConfig::default(),
            reindex_backoff: BackoffConfig::default(),
            reindex_batch_size: default_reindex_batch_size(),
        }
    }
}

/// Configuration for the data migration runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MigrationConfig {
    /// Backoff applied to whole migration runs.
    #[serde(default)]
    pub backoff: BackoffConfig,
    /// Records read, migrated, and written back per chunk.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

#[bon::bon]
impl MigrationConfig {
    /// Creates a new migration configuration with validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    #[builder]
    pub fn new(
        #[builder(default)] backoff: BackoffConfig,
        #[builder(default = default_chunk_size())] chunk_size: usize,
    ) -> Result<Self, ConfigError> {
        let config = Self { backoff, chunk_size };
        config.validate()?;
        Ok(config)
    }
}

impl MigrationConfig {
    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.backoff.validate()?;
        if self.chunk_size == 0 {
            return Err(ConfigError::Validation { message: "chunk_size must be > 0".to_string() });
        }
        Ok(())
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self { backoff: BackoffConfig::default(), chunk_size: default_chunk_size() }
    }
}
