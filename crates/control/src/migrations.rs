//! Data migrations.
//!
//! A data migration rewrites the records of one model's bucket without
//! changing the bucket schema. Each migration has a version; migrated
//! records are stamped with that version in their `data_version` field so
//! that a record is only ever selected by migrations it has not seen yet.
//!
//! [`DataMigrationRunner`] validates the registered migrations up front,
//! then runs every model's migrations in parallel. Within a model,
//! migrations run in ascending version order and each one walks the bucket
//! in bounded chunks:
//!
//! 1. Find up to `chunk_size` records whose `data_version` is absent or
//!    lower than the migration's version.
//! 2. Apply the migration and stamp the version on each record.
//! 3. Write the chunk back in one batch, yield, and repeat until a query
//!    returns nothing.
//!
//! A model that fails stops there; the other models keep going. The whole
//! run is retried with backoff unless a failure comes from a schema-level
//! store error that retrying cannot fix.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use futures::future::join_all;
use parking_lot::Mutex;
use tracing::Instrument;
use vm_inventory_store::{Filter, FindQuery, StoreConnection};
use vm_inventory_types::{
    BucketDescriptor, DATA_VERSION_FIELD, Record, StoreError, StoreErrorKind,
    config::MigrationConfig,
};

use crate::{
    buckets::StartOutcome,
    completion::CompletionSignal,
    error::Error,
    retry::{RetryError, retry_with_backoff},
};

/// Store error kinds that make a migration run non-retryable.
///
/// Any other kind, including kinds added later, is treated as transient.
pub const NON_TRANSIENT_MIGRATION_ERRORS: [StoreErrorKind; 5] = [
    StoreErrorKind::BucketNotFound,
    StoreErrorKind::InvalidIndexType,
    StoreErrorKind::InvalidQuery,
    StoreErrorKind::NotIndexed,
    StoreErrorKind::UniqueAttributeViolation,
];

type MigrateFn = Arc<dyn Fn(Record) -> Record + Send + Sync>;

/// One versioned record transformation.
#[derive(Clone)]
pub struct DataMigration {
    version: u32,
    name: String,
    migrate: MigrateFn,
}

impl DataMigration {
    /// Creates a migration.
    ///
    /// `migrate` must be idempotent and must not depend on anything but the
    /// record.
    pub fn new(
        version: u32,
        name: impl Into<String>,
        migrate: impl Fn(Record) -> Record + Send + Sync + 'static,
    ) -> Self {
        Self { version, name: name.into(), migrate: Arc::new(migrate) }
    }

    /// Target data version.
    #[must_use]
    pub const fn version(&self) -> u32 {
        self.version
    }

    /// Human-readable name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Applies the transformation.
    #[must_use]
    pub fn migrate_record(&self, record: Record) -> Record {
        (self.migrate)(record)
    }
}

impl fmt::Debug for DataMigration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataMigration")
            .field("version", &self.version)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// The migrations of one model, in the order they must run.
#[derive(Debug, Clone)]
pub struct ModelMigrations {
    /// Model name.
    pub model: String,
    /// Bucket storing the model's records.
    pub bucket: String,
    /// Migrations in ascending version order.
    pub migrations: Vec<DataMigration>,
}

impl ModelMigrations {
    /// Creates an entry with no migrations.
    pub fn new(model: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self { model: model.into(), bucket: bucket.into(), migrations: Vec::new() }
    }

    /// Appends a migration.
    #[must_use]
    pub fn with_migration(mut self, migration: DataMigration) -> Self {
        self.migrations.push(migration);
        self
    }
}

/// Checks the migration set against the bucket schemas.
///
/// Returns one message per problem.
#[must_use]
pub fn validate_migrations(
    models: &[ModelMigrations],
    buckets: &[BucketDescriptor],
) -> Vec<String> {
    let mut problems = Vec::new();
    let mut seen_models = BTreeSet::new();

    for model in models {
        if !seen_models.insert(model.model.as_str()) {
            problems.push(format!("model {} is registered more than once", model.model));
        }

        match buckets.iter().find(|b| b.name == model.bucket) {
            None => problems.push(format!(
                "model {} uses bucket {} which is not configured",
                model.model, model.bucket
            )),
            Some(bucket) if !model.migrations.is_empty() && !bucket.is_indexed(DATA_VERSION_FIELD) => {
                problems.push(format!(
                    "bucket {} of model {} does not index {DATA_VERSION_FIELD}",
                    model.bucket, model.model
                ));
            },
            Some(_) => {},
        }

        let mut previous: Option<u32> = None;
        for migration in &model.migrations {
            if migration.version == 0 {
                problems.push(format!(
                    "migration {} of model {} has version 0, versions start at 1",
                    migration.name, model.model
                ));
            }
            if let Some(prev) = previous
                && migration.version <= prev
            {
                problems.push(format!(
                    "migration {} of model {} has version {} which does not follow version {prev}",
                    migration.name, model.model, migration.version
                ));
            }
            previous = Some(migration.version);
        }
    }
    problems
}

/// Latest completed version and latest error per model.
#[derive(Debug, Clone, Default)]
pub struct MigrationProgress {
    /// Highest version fully applied, per model.
    pub latest_completed: BTreeMap<String, u32>,
    /// Most recent failure, per model.
    pub latest_errors: BTreeMap<String, Arc<Error>>,
}

struct Inner {
    connection: StoreConnection,
    models: Vec<ModelMigrations>,
    buckets: Vec<BucketDescriptor>,
    config: MigrationConfig,
    started: AtomicBool,
    progress: Mutex<MigrationProgress>,
    completion: CompletionSignal<StartOutcome>,
}

/// Runs data migrations for every model.
///
/// Cloning is cheap; clones share state.
#[derive(Clone)]
pub struct DataMigrationRunner {
    inner: Arc<Inner>,
}

#[bon::bon]
impl DataMigrationRunner {
    /// Creates a runner. `buckets` are the schemas migrations are checked
    /// against.
    #[builder]
    pub fn new(
        connection: StoreConnection,
        models: Vec<ModelMigrations>,
        buckets: Vec<BucketDescriptor>,
        #[builder(default)] config: MigrationConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                connection,
                models,
                buckets,
                config,
                started: AtomicBool::new(false),
                progress: Mutex::new(MigrationProgress::default()),
                completion: CompletionSignal::new(),
            }),
        }
    }
}

impl DataMigrationRunner {
    /// Validates and runs the migrations in a background task.
    ///
    /// Idempotent. Returns immediately; use [`wait`](Self::wait) for the
    /// outcome. Must be called from within a tokio runtime.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let span = tracing::info_span!("data_migrations", models = inner.models.len());
        tokio::spawn(
            async move {
                let outcome = inner.run().await;
                match &outcome {
                    Ok(()) => tracing::info!("Data migrations complete"),
                    Err(e) => tracing::error!(error = %e, "Data migrations failed"),
                }
                inner.completion.complete(outcome);
            }
            .instrument(span),
        );
    }

    /// Waits for the run to finish.
    pub async fn wait(&self) -> StartOutcome {
        self.inner.completion.wait().await
    }

    /// Run outcome, if finished.
    #[must_use]
    pub fn outcome(&self) -> Option<StartOutcome> {
        self.inner.completion.get()
    }

    /// Highest version fully applied to `model`.
    #[must_use]
    pub fn latest_completed_migration_for_model(&self, model: &str) -> Option<u32> {
        self.inner.progress.lock().latest_completed.get(model).copied()
    }

    /// Highest version fully applied, per model.
    #[must_use]
    pub fn latest_completed_migrations(&self) -> BTreeMap<String, u32> {
        self.inner.progress.lock().latest_completed.clone()
    }

    /// Most recent failure per model, or `None` when no model is failing.
    #[must_use]
    pub fn latest_errors(&self) -> Option<BTreeMap<String, Arc<Error>>> {
        let progress = self.inner.progress.lock();
        (!progress.latest_errors.is_empty()).then(|| progress.latest_errors.clone())
    }

    /// Snapshot of the progress.
    #[must_use]
    pub fn progress(&self) -> MigrationProgress {
        self.inner.progress.lock().clone()
    }
}

impl fmt::Debug for DataMigrationRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataMigrationRunner")
            .field("models", &self.inner.models.len())
            .field("progress", &*self.inner.progress.lock())
            .finish()
    }
}

/// Returns true unless one of the model failures is on the deny-list.
fn is_run_transient(error: &Arc<Error>) -> bool {
    let Error::MigrationsFailed { failures } = error.as_ref() else {
        return false;
    };
    !failures.values().any(|e| {
        e.store_kind().is_some_and(|kind| NON_TRANSIENT_MIGRATION_ERRORS.contains(&kind))
    })
}

impl Inner {
    async fn run(&self) -> StartOutcome {
        let problems = validate_migrations(&self.models, &self.buckets);
        if !problems.is_empty() {
            return Err(Arc::new(Error::InvalidMigrations { problems }));
        }

        let result = retry_with_backoff(
            &self.config.backoff,
            "data migrations",
            is_run_transient,
            |_, _| {},
            || self.run_once(),
        )
        .await;

        result.map_err(|err| {
            Arc::new(match err {
                RetryError::Fatal { attempts, error } => {
                    Error::Fatal { phase: "data migrations", attempts, source: error }
                },
                RetryError::Exhausted { attempts, error } => {
                    Error::RetryExhausted { phase: "data migrations", attempts, source: error }
                },
            })
        })
    }

    async fn run_once(&self) -> Result<(), Arc<Error>> {
        let results = join_all(self.models.iter().map(|model| async move {
            let outcome = self.run_model(model).await;
            (model.model.clone(), outcome)
        }))
        .await;

        let failures: BTreeMap<String, Arc<Error>> =
            results.into_iter().filter_map(|(model, r)| r.err().map(|e| (model, e))).collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Arc::new(Error::MigrationsFailed { failures }))
        }
    }

    async fn run_model(&self, model: &ModelMigrations) -> Result<(), Arc<Error>> {
        let already = self.progress.lock().latest_completed.get(&model.model).copied();
        for migration in &model.migrations {
            if already.is_some_and(|done| migration.version <= done) {
                continue;
            }
            if let Err(error) = self.run_migration(model, migration).await {
                let error = Arc::new(error);
                tracing::warn!(
                    model = %model.model,
                    version = migration.version,
                    error = %error,
                    "Data migration failed"
                );
                self.progress.lock().latest_errors.insert(model.model.clone(), Arc::clone(&error));
                return Err(error);
            }
            self.progress.lock().latest_completed.insert(model.model.clone(), migration.version);
        }
        self.progress.lock().latest_errors.remove(&model.model);
        Ok(())
    }

    async fn run_migration(
        &self,
        model: &ModelMigrations,
        migration: &DataMigration,
    ) -> Result<(), Error> {
        let client = self.connection.client();
        let version = migration.version;
        let query = FindQuery::new(Filter::or([
            Filter::absent(DATA_VERSION_FIELD),
            Filter::lt(DATA_VERSION_FIELD, version),
        ]))
        .with_limit(self.config.chunk_size);
        let store_error = |source: StoreError| Error::Migration { model: model.model.clone(), version, source };

        tracing::info!(model = %model.model, version, name = migration.name(), "Running data migration");
        let mut migrated: u64 = 0;
        loop {
            let records =
                client.find_objects(&model.bucket, &query).await.map_err(store_error)?;
            if records.is_empty() {
                break;
            }

            let count = records.len() as u64;
            let batch: Vec<Record> = records
                .into_iter()
                .map(|record| {
                    let mut record = migration.migrate_record(record);
                    record.set_data_version(version);
                    record
                })
                .collect();
            client.put_batch(&model.bucket, batch).await.map_err(store_error)?;
            migrated += count;
            tracing::debug!(model = %model.model, version, migrated, "Migrated chunk");

            tokio::task::yield_now().await;
        }

        tracing::info!(model = %model.model, version, migrated, "Data migration complete");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use serde_json::{Value, json};
    use vm_inventory_store::{MemoryStore, StorageClient, StoreMethod};
    use vm_inventory_types::{IndexDefinition, config::BackoffConfig};

    use super::*;

    fn bucket(name: &str) -> BucketDescriptor {
        BucketDescriptor::new(name, 1)
            .with_index("uuid", IndexDefinition::string().unique())
            .with_index(DATA_VERSION_FIELD, IndexDefinition::number())
    }

    fn set_field(field: &'static str, value: Value) -> impl Fn(Record) -> Record + Send + Sync {
        move |mut record: Record| {
            record.value.insert(field.to_string(), value.clone());
            record
        }
    }

    async fn store_with(buckets: &[&str], per_bucket: usize) -> MemoryStore {
        let store = MemoryStore::new();
        for name in buckets {
            store.create_bucket(&bucket(name)).await.unwrap();
            for i in 0..per_bucket {
                let uuid = format!("{name}-{i:03}");
                store.put_object(name, Record::from_json(uuid.clone(), json!({"uuid": uuid}))).await.unwrap();
            }
        }
        store
    }

    fn runner(store: &MemoryStore, models: Vec<ModelMigrations>, chunk: usize) -> DataMigrationRunner {
        let buckets = models.iter().map(|m| bucket(&m.bucket)).collect();
        DataMigrationRunner::builder()
            .connection(StoreConnection::new(Arc::new(store.clone())))
            .models(models)
            .buckets(buckets)
            .config(
                MigrationConfig::builder()
                    .chunk_size(chunk)
                    .backoff(
                        BackoffConfig::builder()
                            .initial_delay(Duration::from_millis(1))
                            .max_delay(Duration::from_millis(2))
                            .max_attempts(3)
                            .build()
                            .unwrap(),
                    )
                    .build()
                    .unwrap(),
            )
            .build()
    }

    // =========================================================================
    // Validation
    // =========================================================================

    #[test]
    fn test_validation_reports_every_problem() {
        let models = vec![
            ModelMigrations::new("vms", "vms")
                .with_migration(DataMigration::new(0, "zero", |r| r))
                .with_migration(DataMigration::new(2, "two", |r| r))
                .with_migration(DataMigration::new(2, "two-again", |r| r)),
            ModelMigrations::new("ghosts", "ghosts").with_migration(DataMigration::new(1, "one", |r| r)),
            ModelMigrations::new("plain", "plain").with_migration(DataMigration::new(1, "one", |r| r)),
        ];
        let buckets = vec![
            bucket("vms"),
            BucketDescriptor::new("plain", 1).with_index("uuid", IndexDefinition::string()),
        ];
        let problems = validate_migrations(&models, &buckets);
        assert_eq!(problems.len(), 4, "{problems:?}");
        assert!(problems.iter().any(|p| p.contains("version 0")));
        assert!(problems.iter().any(|p| p.contains("does not follow version 2")));
        assert!(problems.iter().any(|p| p.contains("ghosts")));
        assert!(problems.iter().any(|p| p.contains("does not index data_version")));
    }

    #[test]
    fn test_model_without_migrations_is_valid() {
        let models = vec![ModelMigrations::new("vms", "vms")];
        let buckets = vec![BucketDescriptor::new("vms", 1)];
        assert!(validate_migrations(&models, &buckets).is_empty());
    }

    #[tokio::test]
    async fn test_invalid_migrations_fail_before_any_store_call() {
        let store = store_with(&["vms"], 1).await;
        let models = vec![
            ModelMigrations::new("vms", "vms").with_migration(DataMigration::new(0, "zero", |r| r)),
        ];
        let runner = runner(&store, models, 10);
        runner.start();
        let err = runner.wait().await.unwrap_err();
        assert!(matches!(*err, Error::InvalidMigrations { .. }));
        assert_eq!(store.call_count(StoreMethod::FindObjects), 0);
    }

    // =========================================================================
    // Execution
    // =========================================================================

    #[tokio::test]
    async fn test_migrates_every_record_in_chunks() {
        let store = store_with(&["vms"], 25).await;
        let models = vec![
            ModelMigrations::new("vms", "vms")
                .with_migration(DataMigration::new(1, "add-brand", set_field("brand", json!("joyent"))))
                .with_migration(DataMigration::new(2, "add-docker", set_field("docker", json!(false)))),
        ];
        let runner = runner(&store, models, 10);
        runner.start();
        runner.wait().await.unwrap();

        for record in store.objects("vms") {
            assert_eq!(record.data_version(), Some(2));
            assert_eq!(record.field("brand"), Some(&json!("joyent")));
            assert_eq!(record.field("docker"), Some(&json!(false)));
        }
        assert_eq!(runner.latest_completed_migration_for_model("vms"), Some(2));
        assert!(runner.latest_errors().is_none());
        // Per migration: 3 full chunks plus one empty query.
        assert_eq!(store.call_count(StoreMethod::FindObjects), 8);
        assert_eq!(store.call_count(StoreMethod::PutBatch), 6);
    }

    #[tokio::test]
    async fn test_records_at_target_version_untouched() {
        let store = store_with(&["vms"], 0).await;
        let current = Record::from_json("a", json!({"uuid": "a", "data_version": 1, "brand": "lx"}));
        store.put_object("vms", current.clone()).await.unwrap();

        let models = vec![
            ModelMigrations::new("vms", "vms")
                .with_migration(DataMigration::new(1, "add-brand", set_field("brand", json!("joyent")))),
        ];
        let runner = runner(&store, models, 10);
        runner.start();
        runner.wait().await.unwrap();

        assert_eq!(store.get_object("vms", "a").await.unwrap(), current);
        assert_eq!(store.call_count(StoreMethod::FindObjects), 1);
        assert_eq!(store.call_count(StoreMethod::PutBatch), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_retries_run_and_skips_completed() {
        let store = store_with(&["vms"], 3).await;
        let models = vec![
            ModelMigrations::new("vms", "vms")
                .with_migration(DataMigration::new(1, "one", set_field("a", json!(1))))
                .with_migration(DataMigration::new(2, "two", set_field("b", json!(2)))),
        ];
        // The first batch write fails once; the retried run finishes the job.
        store.inject_error(StoreMethod::PutBatch, StoreError::NoDatabasePeers);
        let runner = runner(&store, models, 10);
        runner.start();
        runner.wait().await.unwrap();

        assert_eq!(runner.latest_completed_migration_for_model("vms"), Some(2));
        assert!(runner.latest_errors().is_none());
        assert!(store.objects("vms").iter().all(|r| r.data_version() == Some(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_transient_failure_stops_retrying() {
        let store = store_with(&["vms"], 2).await;
        let models = vec![
            ModelMigrations::new("vms", "vms")
                .with_migration(DataMigration::new(1, "one", set_field("a", json!(1)))),
        ];
        store.fail_always(
            StoreMethod::FindObjects,
            StoreError::NotIndexed { bucket: "vms".into(), field: "data_version".into() },
        );
        let runner = runner(&store, models, 10);
        runner.start();
        let err = runner.wait().await.unwrap_err();

        assert!(matches!(*err, Error::Fatal { attempts: 1, .. }));
        assert_eq!(store.call_count(StoreMethod::FindObjects), 1);
        let errors = runner.latest_errors().unwrap();
        assert_eq!(errors["vms"].store_kind(), Some(StoreErrorKind::NotIndexed));
        assert_eq!(runner.latest_completed_migration_for_model("vms"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_error_kinds_are_retried() {
        let store = store_with(&["vms"], 2).await;
        let models = vec![
            ModelMigrations::new("vms", "vms")
                .with_migration(DataMigration::new(1, "one", set_field("a", json!(1)))),
        ];
        store.fail_always(StoreMethod::PutBatch, StoreError::Internal { message: "disk".into() });
        let runner = runner(&store, models, 10);
        runner.start();
        let err = runner.wait().await.unwrap_err();
        assert!(matches!(*err, Error::RetryExhausted { attempts: 3, .. }));
    }
}
