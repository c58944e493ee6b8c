//! Startup pipeline integration tests.
//!
//! Drive the bucket manager and the migration runner against the in-memory
//! store the way the service does at boot: setup, reindex, then data
//! migrations.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use serde_json::json;
use vm_inventory_control::{
    BucketInitStatus, BucketSchemaManager, DataMigration, DataMigrationRunner, Error,
    HealthStatus, ModelMigrations, ServiceHealth, catalog, retry_with_backoff,
};
use vm_inventory_store::{MemoryStore, StorageClient, StoreConnection, StoreMethod};
use vm_inventory_test_utils::{test_backoff, test_migration_config};
use vm_inventory_types::{
    BucketDescriptor, DATA_VERSION_FIELD, IndexDefinition, Record, StoreError, StoreErrorKind,
    config::BucketSetupConfig,
};

fn connection(store: &MemoryStore) -> StoreConnection {
    StoreConnection::new(Arc::new(store.clone()))
}

fn setup_config(max_attempts: Option<u32>) -> BucketSetupConfig {
    BucketSetupConfig {
        setup_backoff: test_backoff(max_attempts),
        reindex_backoff: test_backoff(max_attempts),
        reindex_batch_size: 10,
    }
}

fn manager(store: &MemoryStore, buckets: Vec<BucketDescriptor>) -> BucketSchemaManager {
    BucketSchemaManager::builder()
        .connection(connection(store))
        .buckets(buckets)
        .config(setup_config(Some(4)))
        .build()
}

fn vms(version: u32) -> BucketDescriptor {
    BucketDescriptor::new("vms", version)
        .with_index("uuid", IndexDefinition::string().unique())
        .with_index(DATA_VERSION_FIELD, IndexDefinition::number())
}

// =============================================================================
// Bucket versions
// =============================================================================

#[tokio::test]
async fn test_bucket_version_never_regresses() {
    let store = MemoryStore::new();

    for version in [0, 1, 0] {
        let manager = manager(&store, vec![vms(version)]);
        manager.start();
        manager.wait().await.unwrap();
        assert_eq!(manager.status(), BucketInitStatus::BucketsReindexDone);
    }

    let stored = store.get_bucket("vms").await.unwrap();
    assert_eq!(stored.descriptor.version, 1);
    assert_eq!(store.call_count(StoreMethod::CreateBucket), 1);
    assert_eq!(store.call_count(StoreMethod::UpdateBucket), 1);
}

#[tokio::test]
async fn test_version_bump_reindexes_existing_objects() {
    let store = MemoryStore::new();
    store.create_bucket(&vms(1)).await.unwrap();
    for i in 0..25 {
        let uuid = format!("vm-{i:02}");
        store.put_object("vms", Record::from_json(uuid.clone(), json!({"uuid": uuid}))).await.unwrap();
    }

    let manager = manager(&store, vec![vms(2).with_index("state", IndexDefinition::string())]);
    manager.start();
    manager.wait().await.unwrap();

    let stored = store.get_bucket("vms").await.unwrap();
    assert!(!stored.reindex_pending);
    assert!(stored.descriptor.is_indexed("state"));
    // 25 objects in batches of 10.
    assert_eq!(store.call_count(StoreMethod::ReindexBucket), 3);
}

// =============================================================================
// Data migrations
// =============================================================================

#[tokio::test]
async fn test_records_at_target_version_are_left_untouched() {
    let store = MemoryStore::new();
    let buckets = catalog::buckets();
    let manager = manager(&store, buckets.clone());
    manager.start();
    manager.wait().await.unwrap();

    let current = Record::from_json(
        "vm-current",
        json!({"uuid": "vm-current", "internal_metadata": {"role": "db"}, "data_version": 1}),
    );
    let stale =
        Record::from_json("vm-stale", json!({"uuid": "vm-stale", "internal_metadata": {"role": "web"}}));
    store.put_batch("vms", vec![current.clone(), stale]).await.unwrap();

    let run = || {
        DataMigrationRunner::builder()
            .connection(connection(&store))
            .models(catalog::migrations())
            .buckets(buckets.clone())
            .config(test_migration_config(1000))
            .build()
    };

    let first = run();
    first.start();
    first.wait().await.unwrap();
    let after_first = store.objects("vms");

    let second = run();
    second.start();
    second.wait().await.unwrap();
    assert_eq!(store.objects("vms"), after_first);

    let current_after = after_first.iter().find(|r| r.key == "vm-current").unwrap();
    assert_eq!(current_after, &current);
    let stale_after = after_first.iter().find(|r| r.key == "vm-stale").unwrap();
    assert_eq!(stale_after.data_version(), Some(1));
    assert_eq!(
        stale_after.field(catalog::INTERNAL_METADATA_SEARCH_FIELD).unwrap(),
        &json!(["role=web"])
    );
}

#[tokio::test]
async fn test_failing_model_does_not_stop_the_other() {
    let store = MemoryStore::new();
    let good = vms(1);
    let bad = BucketDescriptor::new("vm_tags", 1)
        .with_index("uuid", IndexDefinition::string().unique())
        .with_index("count", IndexDefinition::number())
        .with_index(DATA_VERSION_FIELD, IndexDefinition::number());
    for (bucket, prefix) in [(&good, "vm"), (&bad, "tag")] {
        store.create_bucket(bucket).await.unwrap();
        for i in 0..30 {
            let uuid = format!("{prefix}-{i:02}");
            store
                .put_object(&bucket.name, Record::from_json(uuid.clone(), json!({"uuid": uuid})))
                .await
                .unwrap();
        }
    }

    let models = vec![
        ModelMigrations::new("vms", "vms").with_migration(DataMigration::new(1, "touch", |r| r)),
        // A string in a number index is rejected by the store on every write.
        ModelMigrations::new("vm_tags", "vm_tags").with_migration(DataMigration::new(
            1,
            "break-count",
            |mut r: Record| {
                r.value.insert("count".to_string(), json!("many"));
                r
            },
        )),
    ];
    let runner = DataMigrationRunner::builder()
        .connection(connection(&store))
        .models(models)
        .buckets(vec![good, bad])
        .config(test_migration_config(7))
        .build();
    runner.start();
    let err = runner.wait().await.unwrap_err();

    let Error::Fatal { attempts, source, .. } = err.as_ref() else {
        panic!("expected a fatal error, got {err}");
    };
    assert_eq!(*attempts, 1);
    let Error::MigrationsFailed { failures } = source.as_ref() else {
        panic!("expected per-model failures, got {source}");
    };
    assert_eq!(failures.keys().collect::<Vec<_>>(), vec!["vm_tags"]);
    assert_eq!(failures["vm_tags"].store_kind(), Some(StoreErrorKind::InvalidIndexType));

    assert_eq!(runner.latest_completed_migration_for_model("vms"), Some(1));
    assert_eq!(runner.latest_completed_migration_for_model("vm_tags"), None);
    assert!(store.objects("vms").iter().all(|r| r.data_version() == Some(1)));
    assert!(store.objects("vm_tags").iter().all(|r| r.data_version().is_none()));
    assert!(runner.latest_errors().unwrap().contains_key("vm_tags"));
}

// =============================================================================
// Backoff termination
// =============================================================================

#[tokio::test]
async fn test_capped_retry_makes_exactly_k_attempts() {
    for cap in [1u32, 3, 6] {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(
            &test_backoff(Some(cap)),
            "test",
            StoreError::is_transient,
            |_, _| {},
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(StoreError::connection("refused")) }
            },
        )
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts(), cap);
        assert_eq!(calls.load(Ordering::SeqCst), cap);
    }
}

#[tokio::test]
async fn test_bucket_setup_gives_up_after_cap() {
    let store = MemoryStore::new();
    store.fail_always(StoreMethod::GetBucket, StoreError::connection("refused"));
    let manager = manager(&store, vec![vms(1)]);
    manager.start();

    let err = manager.wait().await.unwrap_err();
    assert!(matches!(*err, Error::RetryExhausted { attempts: 4, .. }), "{err}");
    assert_eq!(store.call_count(StoreMethod::GetBucket), 4);
    assert_eq!(manager.status(), BucketInitStatus::Failed);
}

#[tokio::test]
async fn test_unlimited_setup_recovers_when_store_returns() {
    let store = MemoryStore::new();
    store.fail_always(StoreMethod::GetBucket, StoreError::connection("refused"));
    let manager = BucketSchemaManager::builder()
        .connection(connection(&store))
        .buckets(vec![vms(1)])
        .config(setup_config(None))
        .build();
    manager.start();

    assert!(
        vm_inventory_test_utils::assert_eventually(Duration::from_secs(5), || {
            store.call_count(StoreMethod::GetBucket) >= 10
        })
        .await
    );
    assert_eq!(manager.status(), BucketInitStatus::Started);
    assert!(manager.last_init_error().is_some());

    store.clear_errors(StoreMethod::GetBucket);
    manager.wait().await.unwrap();
    assert!(manager.last_init_error().is_none());
}

// =============================================================================
// Full pipeline
// =============================================================================

#[tokio::test]
async fn test_catalog_pipeline_reports_healthy() {
    let store = MemoryStore::new();
    let buckets = catalog::buckets();
    let manager = manager(&store, buckets.clone());
    let runner = DataMigrationRunner::builder()
        .connection(connection(&store))
        .models(catalog::migrations())
        .buckets(buckets)
        .config(test_migration_config(1000))
        .build();
    let health = ServiceHealth::new(manager.clone()).with_migrations(runner.clone());

    manager.start();
    manager.wait().await.unwrap();
    runner.start();
    runner.wait().await.unwrap();

    let report = health.report();
    assert_eq!(report.status, HealthStatus::Healthy);
    assert_eq!(report.buckets, "BUCKETS_REINDEX_DONE");
    assert_eq!(report.migrations.get("vms"), Some(&1));
    for bucket in [
        catalog::VMS_BUCKET,
        catalog::SERVER_VMS_BUCKET,
        catalog::VM_ROLE_TAGS_BUCKET,
        catalog::VM_MIGRATIONS_BUCKET,
    ] {
        store.get_bucket(bucket).await.unwrap();
    }
}
