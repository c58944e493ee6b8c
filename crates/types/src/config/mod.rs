//! Configuration types for the VM inventory data layer.
//!
//! Configuration is loaded from TOML files and environment variables.
//! All config structs validate their values at construction time via
//! fallible builders. Post-deserialization validation is available via
//! the `validate()` method on each struct.

// The schemars `JsonSchema` derive macro internally uses `.unwrap()` in its
// expansions.
#![allow(clippy::unwrap_used)]

mod node;
mod observability;
mod pagination;
mod resilience;
mod storage;

pub use node::*;
pub use observability::*;
pub use pagination::*;
pub use resilience::*;
use snafu::Snafu;
pub use storage::*;

/// Configuration validation error.
///
/// Returned when a configuration value is outside its valid range or
/// violates a cross-field constraint.
#[derive(Debug, Snafu)]
pub enum ConfigError {
    /// A configuration value is invalid.
    #[snafu(display("invalid config: {message}"))]
    Validation {
        /// Description of the validation failure.
        message: String,
    },
}

/// Duration serialization using humantime format.
mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

/// Optional duration serialization using humantime format.
mod option_humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&humantime::format_duration(*d).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer)?
            .map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use super::*;

    // =========================================================================
    // BackoffConfig
    // =========================================================================

    #[test]
    fn test_backoff_config_defaults() {
        let config = BackoffConfig::builder().build().expect("defaults should be valid");
        assert_eq!(config.initial_delay, Duration::from_millis(10));
        assert_eq!(config.max_delay, Duration::from_millis(5000));
        assert_eq!(config.max_attempts, None);
        assert!(!config.jitter);
    }

    #[test]
    fn test_backoff_config_max_attempts_zero_rejected() {
        let result = BackoffConfig::builder().max_attempts(0).build();
        let err = result.unwrap_err();
        assert!(err.to_string().contains("max_attempts"));
    }

    #[test]
    fn test_backoff_config_max_below_initial_rejected() {
        let result = BackoffConfig::builder()
            .initial_delay(Duration::from_secs(2))
            .max_delay(Duration::from_secs(1))
            .build();
        let err = result.unwrap_err();
        assert!(err.to_string().contains("max_delay"));
    }

    #[test]
    fn test_backoff_config_multiplier_below_one_rejected() {
        let result = BackoffConfig::builder().multiplier(0.5).build();
        assert!(result.is_err());
    }

    // =========================================================================
    // JobWaitConfig
    // =========================================================================

    #[test]
    fn test_job_wait_config_defaults() {
        let config = JobWaitConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.max_poll_attempts, 720);
        assert_eq!(config.max_consecutive_errors, 5);
        assert_eq!(config.idle_teardown, Duration::from_secs(30));
        config.validate().expect("defaults should be valid");
    }

    #[test]
    fn test_job_wait_config_timeout_optional() {
        assert_eq!(JobWaitConfig::default().timeout, None);

        let config: JobWaitConfig = toml::from_str(r#"timeout = "1h""#).expect("parse config");
        assert_eq!(config.timeout, Some(Duration::from_secs(3600)));
        config.validate().expect("valid config");

        let err = JobWaitConfig::builder().timeout(Duration::ZERO).build().unwrap_err();
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn test_job_wait_config_empty_topic_rejected() {
        let result = JobWaitConfig::builder().topic(String::new()).build();
        let err = result.unwrap_err();
        assert!(err.to_string().contains("topic"));
    }

    // =========================================================================
    // Storage configs
    // =========================================================================

    #[test]
    fn test_migration_config_chunk_size_zero_rejected() {
        let result = MigrationConfig::builder().chunk_size(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_bucket_setup_config_defaults() {
        let config = BucketSetupConfig::default();
        assert_eq!(config.reindex_batch_size, 100);
        assert_eq!(config.setup_backoff, BackoffConfig::default());
    }

    // =========================================================================
    // PaginationConfig
    // =========================================================================

    #[test]
    fn test_pagination_config_requires_order_field_sortable() {
        let result = PaginationConfig::builder()
            .total_order_field("uuid".to_string())
            .sortable_fields(vec!["alias".to_string()])
            .build();
        let err = result.unwrap_err();
        assert!(err.to_string().contains("total_order_field"));
    }

    #[test]
    fn test_pagination_config_timestamp_fields_must_be_sortable() {
        let result =
            PaginationConfig::builder().timestamp_fields(vec!["deleted_at".to_string()]).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_pagination_config_field_kinds() {
        let config = PaginationConfig::default();
        assert_eq!(config.field_kind("max_physical_memory"), FieldKind::Number);
        assert_eq!(config.field_kind("create_timestamp"), FieldKind::Number);
        assert_eq!(config.field_kind("docker"), FieldKind::Boolean);
        assert_eq!(config.field_kind("tags"), FieldKind::StringArray);
        assert_eq!(config.field_kind("alias"), FieldKind::String);
    }

    #[test]
    fn test_pagination_config_rejects_conflicting_field_kinds() {
        let result = PaginationConfig::builder()
            .boolean_fields(vec!["docker".to_string(), "max_physical_memory".to_string()])
            .build();
        assert!(result.unwrap_err().to_string().contains("more than one type"));

        let result = PaginationConfig::builder().array_fields(vec!["nics".to_string()]).build();
        assert!(result.unwrap_err().to_string().contains("array field nics"));
    }

    // =========================================================================
    // ServiceConfig
    // =========================================================================

    #[test]
    fn test_service_config_from_partial_toml() {
        let raw = r#"
            [jobs]
            poll_interval = "2s"
            max_poll_attempts = 10

            [buckets.setup_backoff]
            max_attempts = 4
        "#;
        let config: ServiceConfig = toml::from_str(raw).expect("parse config");
        config.validate().expect("valid config");
        assert_eq!(config.jobs.poll_interval, Duration::from_secs(2));
        assert_eq!(config.jobs.max_poll_attempts, 10);
        assert_eq!(config.buckets.setup_backoff.max_attempts, Some(4));
        assert_eq!(config.migrations.chunk_size, 1000);
        assert_eq!(config.logging.format, LogFormat::Auto);
    }
}
