//! Shared test utilities for the VM inventory crates.
//!
//! - [`assert_eventually`] - Poll a condition until it's true or timeout
//! - [`test_backoff`] - Millisecond backoff for retry loops
//! - [`test_migration_config`] / [`test_job_wait_config`] - Small budgets for tests
//! - [`strategies`] - Proptest generators for sorts, markers, and VM records

#![deny(unsafe_code)]
// Test utilities are allowed to use unwrap for simplicity
#![cfg_attr(test, allow(clippy::disallowed_methods))]

mod assertions;
pub use assertions::assert_eventually;

mod config;
pub use config::{test_backoff, test_job_wait_config, test_migration_config};

pub mod strategies;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use proptest::prelude::*;

    use super::*;

    // ============================================
    // assert_eventually tests
    // ============================================

    #[tokio::test]
    async fn test_assert_eventually_immediate_success() {
        let result = assert_eventually(Duration::from_millis(100), || true).await;
        assert!(result, "immediately true condition should succeed");
    }

    #[tokio::test]
    async fn test_assert_eventually_delayed_success() {
        let counter = AtomicUsize::new(0);
        let result = assert_eventually(Duration::from_millis(500), || {
            counter.fetch_add(1, Ordering::SeqCst) >= 3
        })
        .await;
        assert!(result, "condition should eventually become true");
        assert!(counter.load(Ordering::SeqCst) >= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_assert_eventually_timeout() {
        let result = assert_eventually(Duration::from_secs(30), || false).await;
        assert!(!result, "never-true condition should timeout");
    }

    // ============================================
    // Config helper tests
    // ============================================

    #[test]
    fn test_configs_pass_validation() {
        test_backoff(None).validate().unwrap();
        test_backoff(Some(1)).validate().unwrap();
        test_migration_config(10).validate().unwrap();
        test_job_wait_config().validate().unwrap();
    }

    // ============================================
    // Strategy tests
    // ============================================

    proptest! {
        #[test]
        fn test_vm_records_have_distinct_keys(records in strategies::arb_vm_records(20)) {
            let mut keys: Vec<_> = records.iter().map(|r| r.key.clone()).collect();
            keys.dedup();
            prop_assert_eq!(keys.len(), records.len());
            for record in &records {
                prop_assert_eq!(record.field("uuid").and_then(|v| v.as_str()), Some(record.key.as_str()));
            }
        }
    }
}
