//! Test configuration helpers.
//!
//! Centralizes the small delays and budgets tests use so retries finish in
//! milliseconds instead of the production seconds.

use std::time::Duration;

use vm_inventory_types::config::{BackoffConfig, JobWaitConfig, MigrationConfig};

/// Backoff for tests: 1ms initial delay, 4ms cap, no jitter.
///
/// `max_attempts` of `None` retries forever.
#[must_use]
pub fn test_backoff(max_attempts: Option<u32>) -> BackoffConfig {
    BackoffConfig {
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(4),
        multiplier: 2.0,
        max_attempts,
        jitter: false,
    }
}

/// Migration configuration with a fast backoff capped at three attempts.
#[must_use]
pub fn test_migration_config(chunk_size: usize) -> MigrationConfig {
    MigrationConfig { backoff: test_backoff(Some(3)), chunk_size }
}

/// Job wait configuration for tests:
/// - `poll_interval`: 5s, meant for a paused clock
/// - `max_poll_attempts`: 10
/// - `max_consecutive_errors`: 2
#[must_use]
pub fn test_job_wait_config() -> JobWaitConfig {
    JobWaitConfig {
        poll_interval: Duration::from_secs(5),
        max_poll_attempts: 10,
        max_consecutive_errors: 2,
        idle_teardown: Duration::from_secs(30),
        topic: "wf_job_updates".to_string(),
        timeout: None,
    }
}
