//! The data layer service.
//!
//! Owns the store connection and every control-plane component built on it.
//! Startup returns once bucket setup is done. Reindexing continues in the
//! background and data migrations start after it, while the service serves.

use std::{sync::Arc, time::Duration};

use snafu::ResultExt;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use vm_inventory_control::{
    BucketSchemaManager, DataMigrationRunner, HealthStatus, JobWaiter, MarkerPaginator,
    ServiceHealth, catalog,
    jobs::{BucketJobSource, DEFAULT_JOBS_BUCKET},
};
use vm_inventory_store::{BroadcastPublisher, ChangeEvent, MemoryStore, StoreConnection};
use vm_inventory_types::{BucketDescriptor, config::ServiceConfig};

use crate::error::{BucketInitSnafu, Result};

/// Events buffered per change-feed subscriber.
const CHANGE_FEED_CAPACITY: usize = 1024;

/// How often the health report is checked for changes.
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Buckets created at startup: the catalog plus the workflow jobs bucket.
#[must_use]
pub fn startup_buckets() -> Vec<BucketDescriptor> {
    let mut buckets = catalog::buckets();
    buckets.push(BucketDescriptor::new(DEFAULT_JOBS_BUCKET, 1));
    buckets
}

/// A running data layer.
#[derive(Debug)]
pub struct Service {
    store: MemoryStore,
    changes: BroadcastPublisher,
    buckets: BucketSchemaManager,
    migrations: DataMigrationRunner,
    jobs: JobWaiter,
    paginator: MarkerPaginator,
    health: ServiceHealth,
}

impl Service {
    /// Builds a service over a fresh in-memory store. Data is lost on exit.
    #[must_use]
    pub fn ephemeral(config: &ServiceConfig) -> Self {
        Self::with_store(config, MemoryStore::new())
    }

    /// Builds a service over `store`.
    #[must_use]
    pub fn with_store(config: &ServiceConfig, store: MemoryStore) -> Self {
        let changes = BroadcastPublisher::new(CHANGE_FEED_CAPACITY);
        store.set_publisher(Arc::new(changes.clone()));
        let connection = StoreConnection::new(Arc::new(store.clone()));
        let buckets = startup_buckets();

        let manager = BucketSchemaManager::builder()
            .connection(connection.clone())
            .buckets(buckets.clone())
            .config(config.buckets.clone())
            .build();
        let migrations = DataMigrationRunner::builder()
            .connection(connection.clone())
            .models(catalog::migrations())
            .buckets(buckets)
            .config(config.migrations.clone())
            .build();
        let source = Arc::new(BucketJobSource::new(connection.clone()));
        let jobs = JobWaiter::new(source, connection, config.jobs.clone());
        let health = ServiceHealth::new(manager.clone()).with_migrations(migrations.clone());

        Self {
            store,
            changes,
            buckets: manager,
            migrations,
            jobs,
            paginator: MarkerPaginator::new(config.pagination.clone()),
            health,
        }
    }

    /// Sets up every bucket, then hands off to a background task that waits
    /// for reindexing and starts data migrations.
    ///
    /// Returns once bucket setup is done, so the service can report health
    /// while reindexing retries. Reindex and migration failures degrade
    /// health instead of stopping the service.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::BucketInit`](crate::error::ServerError::BucketInit)
    /// if bucket setup fails permanently.
    pub async fn start(&self) -> Result<()> {
        self.buckets.start();
        self.buckets.wait_for_setup().await.context(BucketInitSnafu)?;
        tracing::info!(buckets = self.buckets.buckets().len(), "Buckets set up");

        let buckets = self.buckets.clone();
        let migrations = self.migrations.clone();
        tokio::spawn(async move {
            match buckets.wait().await {
                Ok(()) => {
                    tracing::info!("Buckets reindexed");
                    migrations.start();
                },
                Err(error) => {
                    tracing::error!(error = %error, "Bucket initialization failed, data migrations not started");
                },
            }
        });
        Ok(())
    }

    /// Serves until `shutdown` is cancelled.
    ///
    /// Logs committed changes at debug level and the health report whenever
    /// its status changes.
    pub async fn run(&self, shutdown: CancellationToken) {
        let change_log = tokio::spawn(log_changes(self.changes.subscribe(), shutdown.child_token()));

        let mut last_status = None;
        let mut interval = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let report = self.health.report();
                    if last_status != Some(report.status) {
                        log_health(&report);
                        last_status = Some(report.status);
                    }
                }
            }
        }

        self.health.mark_shutting_down();
        if let Err(e) = change_log.await {
            tracing::warn!(error = %e, "Change log task failed");
        }
        tracing::info!("Service stopped");
    }

    /// Backing store.
    #[must_use]
    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    /// Bucket manager.
    #[must_use]
    pub fn buckets(&self) -> &BucketSchemaManager {
        &self.buckets
    }

    /// Data migration runner.
    #[must_use]
    pub fn migrations(&self) -> &DataMigrationRunner {
        &self.migrations
    }

    /// Workflow job waits.
    #[must_use]
    pub fn jobs(&self) -> &JobWaiter {
        &self.jobs
    }

    /// Marker pagination over indexed fields.
    #[must_use]
    pub fn paginator(&self) -> &MarkerPaginator {
        &self.paginator
    }

    /// Health probes and reports.
    #[must_use]
    pub fn health(&self) -> &ServiceHealth {
        &self.health
    }
}

fn log_health(report: &vm_inventory_control::HealthReport) {
    match report.status {
        HealthStatus::Healthy => tracing::info!(
            buckets = %report.buckets,
            migrations = ?report.migrations,
            "Service healthy"
        ),
        HealthStatus::Degraded => tracing::warn!(
            buckets = %report.buckets,
            migration_errors = ?report.migration_errors,
            "Service degraded"
        ),
        HealthStatus::Unhealthy => tracing::error!(
            buckets = %report.buckets,
            error = ?report.bucket_error,
            "Service unhealthy"
        ),
    }
}

async fn log_changes(mut events: broadcast::Receiver<ChangeEvent>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => return,
            event = events.recv() => match event {
                Ok(event) => tracing::debug!(
                    bucket = %event.bucket,
                    key = %event.key,
                    kind = ?event.kind,
                    fields = ?event.changed_fields,
                    "Object changed"
                ),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Change log fell behind");
                },
                Err(RecvError::Closed) => return,
            },
        }
    }
}
