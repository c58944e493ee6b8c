//! Backoff and job-wait configuration.

use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ConfigError;

// =============================================================================
// Backoff Configuration
// =============================================================================

/// Default delay before the first retry (10ms).
const fn default_initial_delay() -> Duration {
    Duration::from_millis(10)
}

/// Default cap on the delay between retries (5s).
const fn default_max_delay() -> Duration {
    Duration::from_millis(5000)
}

/// Default exponential growth factor.
const fn default_multiplier() -> f64 {
    2.0
}

/// Exponential backoff policy for the startup retry loops.
///
/// `max_attempts` counts every attempt including the first one. `None`
/// retries transient failures forever.
///
/// # Example
///
/// ```no_run
/// # use std::time::Duration;
/// # use vm_inventory_types::config::BackoffConfig;
/// let config = BackoffConfig::builder()
///     .initial_delay(Duration::from_millis(50))
///     .max_attempts(10)
///     .build()
///     .expect("valid backoff config");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    #[serde(default = "default_initial_delay")]
    #[serde(with = "super::humantime_serde")]
    #[schemars(with = "String")]
    pub initial_delay: Duration,
    /// Upper bound for the delay between two attempts.
    #[serde(default = "default_max_delay")]
    #[serde(with = "super::humantime_serde")]
    #[schemars(with = "String")]
    pub max_delay: Duration,
    /// Growth factor applied to the delay after each failed attempt.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Maximum number of attempts, including the first. Unlimited when unset.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Randomize each delay to spread out concurrent retries.
    #[serde(default)]
    pub jitter: bool,
}

#[bon::bon]
impl BackoffConfig {
    /// Creates a new backoff configuration with validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    #[builder]
    pub fn new(
        #[builder(default = default_initial_delay())] initial_delay: Duration,
        #[builder(default = default_max_delay())] max_delay: Duration,
        #[builder(default = default_multiplier())] multiplier: f64,
        max_attempts: Option<u32>,
        #[builder(default)] jitter: bool,
    ) -> Result<Self, ConfigError> {
        let config = Self { initial_delay, max_delay, multiplier, max_attempts, jitter };
        config.validate()?;
        Ok(config)
    }
}

impl BackoffConfig {
    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_delay.is_zero() {
            return Err(ConfigError::Validation {
                message: "initial_delay must be > 0".to_string(),
            });
        }
        if self.max_delay < self.initial_delay {
            return Err(ConfigError::Validation {
                message: format!(
                    "max_delay ({:?}) must be >= initial_delay ({:?})",
                    self.max_delay, self.initial_delay
                ),
            });
        }
        if !(self.multiplier >= 1.0) {
            return Err(ConfigError::Validation {
                message: "multiplier must be >= 1.0".to_string(),
            });
        }
        if self.max_attempts == Some(0) {
            return Err(ConfigError::Validation {
                message: "max_attempts must be > 0 when set".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            multiplier: default_multiplier(),
            max_attempts: None,
            jitter: false,
        }
    }
}

// =============================================================================
// Job Wait Configuration
// =============================================================================

/// Default interval between job polls (5s).
const fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}

/// Default poll attempts (720 × 5s ≈ one hour).
const fn default_max_poll_attempts() -> u32 {
    720
}

/// Default consecutive fetch errors tolerated.
const fn default_max_consecutive_errors() -> u32 {
    5
}

/// Default grace period before an unused subscription is closed (30s).
const fn default_idle_teardown() -> Duration {
    Duration::from_secs(30)
}

/// Default notification topic for workflow job changes.
fn default_topic() -> String {
    "wf_job_updates".to_string()
}

/// Configuration for waiting on workflow jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct JobWaitConfig {
    /// Interval between two polls of the job record.
    #[serde(default = "default_poll_interval")]
    #[serde(with = "super::humantime_serde")]
    #[schemars(with = "String")]
    pub poll_interval: Duration,
    /// Polls made before the wait times out.
    #[serde(default = "default_max_poll_attempts")]
    pub max_poll_attempts: u32,
    /// Consecutive fetch errors tolerated before the wait fails.
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
    /// How long an unused notification subscription stays open.
    #[serde(default = "default_idle_teardown")]
    #[serde(with = "super::humantime_serde")]
    #[schemars(with = "String")]
    pub idle_teardown: Duration,
    /// Pub/sub topic carrying job notifications.
    #[serde(default = "default_topic")]
    pub topic: String,
    /// Time limit for a whole wait, fetches included. When unset only
    /// `max_poll_attempts` bounds a wait.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[serde(with = "super::option_humantime_serde")]
    #[schemars(with = "Option<String>")]
    pub timeout: Option<Duration>,
}

#[bon::bon]
impl JobWaitConfig {
    /// Creates a new job wait configuration with validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    #[builder]
    pub fn new(
        #[builder(default = default_poll_interval())] poll_interval: Duration,
        #[builder(default = default_max_poll_attempts())] max_poll_attempts: u32,
        #[builder(default = default_max_consecutive_errors())] max_consecutive_errors: u32,
        #[builder(default = default_idle_teardown())] idle_teardown: Duration,
        #[builder(default = default_topic())] topic: String,
        timeout: Option<Duration>,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            poll_interval,
            max_poll_attempts,
            max_consecutive_errors,
            idle_teardown,
            topic,
            timeout,
        };
        config.validate()?;
        Ok(config)
    }
}

impl JobWaitConfig {
    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Validation {
                message: "poll_interval must be > 0".to_string(),
            });
        }
        if self.max_poll_attempts == 0 {
            return Err(ConfigError::Validation {
                message: "max_poll_attempts must be > 0".to_string(),
            });
        }
        if self.topic.is_empty() {
            return Err(ConfigError::Validation { message: "topic must not be empty".to_string() });
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::Validation { message: "timeout must be > 0".to_string() });
        }
        Ok(())
    }
}

impl Default for JobWaitConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            max_poll_attempts: default_max_poll_attempts(),
            max_consecutive_errors: default_max_consecutive_errors(),
            idle_teardown: default_idle_teardown(),
            topic: default_topic(),
            timeout: None,
        }
    }
}
