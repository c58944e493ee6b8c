//! Service health derived from startup progress.
//!
//! # Probes
//!
//! - **Liveness**: fails only when bucket initialization failed permanently.
//!   A service whose buckets are set up but still reindexing stays live.
//! - **Readiness**: passes once every bucket exists at its desired version
//!   and the service is not shutting down.
//!
//! [`ServiceHealth::report`] folds the bucket manager status and the
//! migration runner progress into a single [`HealthStatus`].

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use serde::Serialize;

use crate::{
    buckets::{BucketInitStatus, BucketSchemaManager},
    migrations::DataMigrationRunner,
};

/// Overall service health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Fully operational.
    Healthy,
    /// Serving, with background work pending or failing.
    Degraded,
    /// Not able to serve.
    Unhealthy,
}

/// Point-in-time health snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Aggregated status.
    pub status: HealthStatus,
    /// Bucket initialization status, e.g. `BUCKETS_SETUP_DONE`.
    pub buckets: String,
    /// Most recent bucket initialization error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket_error: Option<String>,
    /// Highest applied migration version per model.
    pub migrations: BTreeMap<String, u32>,
    /// Most recent migration error per model.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub migration_errors: BTreeMap<String, String>,
}

/// Health of the data layer.
///
/// Cloning is cheap; clones share state.
#[derive(Debug, Clone)]
pub struct ServiceHealth {
    buckets: BucketSchemaManager,
    migrations: Option<DataMigrationRunner>,
    shutting_down: Arc<AtomicBool>,
}

impl ServiceHealth {
    /// Tracks `buckets` only.
    #[must_use]
    pub fn new(buckets: BucketSchemaManager) -> Self {
        Self { buckets, migrations: None, shutting_down: Arc::new(AtomicBool::new(false)) }
    }

    /// Also tracks `migrations`.
    #[must_use]
    pub fn with_migrations(mut self, migrations: DataMigrationRunner) -> Self {
        self.migrations = Some(migrations);
        self
    }

    /// Fails readiness from now on. Idempotent.
    pub fn mark_shutting_down(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }

    /// Liveness probe.
    #[must_use]
    pub fn liveness_check(&self) -> bool {
        self.buckets.status() != BucketInitStatus::Failed
    }

    /// Readiness probe.
    #[must_use]
    pub fn readiness_check(&self) -> bool {
        !self.shutting_down.load(Ordering::Acquire)
            && matches!(
                self.buckets.status(),
                BucketInitStatus::BucketsSetupDone | BucketInitStatus::BucketsReindexDone
            )
    }

    /// Builds a health snapshot.
    #[must_use]
    pub fn report(&self) -> HealthReport {
        let bucket_status = self.buckets.status();
        let progress = self.migrations.as_ref().map(DataMigrationRunner::progress).unwrap_or_default();
        let migration_errors: BTreeMap<String, String> = progress
            .latest_errors
            .iter()
            .map(|(model, error)| (model.clone(), error.to_string()))
            .collect();

        let status = match bucket_status {
            BucketInitStatus::NotStarted | BucketInitStatus::Started | BucketInitStatus::Failed => {
                HealthStatus::Unhealthy
            },
            BucketInitStatus::BucketsSetupDone => HealthStatus::Degraded,
            BucketInitStatus::BucketsReindexDone if !migration_errors.is_empty() => {
                HealthStatus::Degraded
            },
            BucketInitStatus::BucketsReindexDone => HealthStatus::Healthy,
        };

        HealthReport {
            status,
            buckets: bucket_status.to_string(),
            bucket_error: self.buckets.last_init_error().map(|e| e.to_string()),
            migrations: progress.latest_completed,
            migration_errors,
        }
    }
}
