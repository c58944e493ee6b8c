//! Top-level service configuration.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{
    BucketSetupConfig, ConfigError, JobWaitConfig, LoggingConfig, MigrationConfig,
    PaginationConfig,
};

/// Configuration of the whole data layer, as loaded by the server binary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ServiceConfig {
    /// Bucket setup and reindex.
    #[serde(default)]
    pub buckets: BucketSetupConfig,
    /// Data migrations.
    #[serde(default)]
    pub migrations: MigrationConfig,
    /// Workflow job waits.
    #[serde(default)]
    pub jobs: JobWaitConfig,
    /// Marker pagination.
    #[serde(default)]
    pub pagination: PaginationConfig,
    /// Logging.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ServiceConfig {
    /// Validates every section.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError::Validation`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.buckets.validate()?;
        self.migrations.validate()?;
        self.jobs.validate()?;
        self.pagination.validate()?;
        Ok(())
    }
}
