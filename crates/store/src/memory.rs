//! In-memory store backend.
//!
//! [`MemoryStore`] implements the full [`StorageClient`] contract in process:
//! bucket versioning, index validation, unique constraints, indexed search,
//! incremental reindexing, and pub/sub topics. It also carries the hooks
//! tests need to exercise failure handling:
//!
//! - **Error injection**: queue one-shot errors per RPC, or make an RPC fail
//!   on every call
//! - **Listen capability**: disable pub/sub so `listen` returns
//!   `UnsupportedRpc`
//! - **Call counting**: number of calls per RPC
//! - **Latency**: delay applied to every RPC
//!
//! Committed writes are reported to an optional [`ChangePublisher`].

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use snafu::ensure;
use tokio::sync::mpsc;
use vm_inventory_types::{
    BucketDescriptor, Record, RecordValue, StoreError, StoreResult, StoredBucket,
    error::{
        BucketNotFoundSnafu, BucketVersionSnafu, InvalidBucketConfigSnafu, InvalidIndexTypeSnafu,
        InvalidQuerySnafu, NotIndexedSnafu, ObjectNotFoundSnafu, UniqueAttributeSnafu,
        UnsupportedRpcSnafu,
    },
};

use crate::{
    changefeed::{ChangeEvent, ChangeKind, ChangePublisher},
    client::{ReindexResult, StorageClient, Subscription},
    query::{FindQuery, compare_records},
};

/// RPCs of the store contract, used to target injected failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreMethod {
    /// [`StorageClient::get_bucket`].
    GetBucket,
    /// [`StorageClient::create_bucket`].
    CreateBucket,
    /// [`StorageClient::update_bucket`].
    UpdateBucket,
    /// [`StorageClient::reindex_bucket`].
    ReindexBucket,
    /// [`StorageClient::get_object`].
    GetObject,
    /// [`StorageClient::put_object`].
    PutObject,
    /// [`StorageClient::delete_object`].
    DeleteObject,
    /// [`StorageClient::find_objects`].
    FindObjects,
    /// [`StorageClient::put_batch`].
    PutBatch,
    /// [`StorageClient::listen`].
    Listen,
}

impl StoreMethod {
    const ALL: [Self; 10] = [
        Self::GetBucket,
        Self::CreateBucket,
        Self::UpdateBucket,
        Self::ReindexBucket,
        Self::GetObject,
        Self::PutObject,
        Self::DeleteObject,
        Self::FindObjects,
        Self::PutBatch,
        Self::Listen,
    ];

    const fn index(self) -> usize {
        self as usize
    }
}

type TopicSender = mpsc::UnboundedSender<StoreResult<Value>>;

/// One bucket's schema and objects.
#[derive(Debug)]
struct BucketState {
    descriptor: BucketDescriptor,
    objects: BTreeMap<String, RecordValue>,
    /// Objects still written under a previous schema version.
    reindex_remaining: usize,
}

#[derive(Debug)]
struct MemoryState {
    buckets: RwLock<HashMap<String, BucketState>>,
    topics: Mutex<HashMap<String, Vec<TopicSender>>>,
    queued_errors: Mutex<HashMap<StoreMethod, VecDeque<StoreError>>>,
    sticky_errors: Mutex<HashMap<StoreMethod, StoreError>>,
    calls: [AtomicUsize; StoreMethod::ALL.len()],
    listen_supported: AtomicBool,
    delay_ms: AtomicU64,
    publisher: RwLock<PublisherSlot>,
}

#[derive(Default)]
struct PublisherSlot(Option<Arc<dyn ChangePublisher>>);

impl std::fmt::Debug for PublisherSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(if self.0.is_some() { "Some(..)" } else { "None" })
    }
}

impl Default for MemoryState {
    fn default() -> Self {
        Self {
            buckets: RwLock::default(),
            topics: Mutex::default(),
            queued_errors: Mutex::default(),
            sticky_errors: Mutex::default(),
            calls: Default::default(),
            listen_supported: AtomicBool::new(true),
            delay_ms: AtomicU64::new(0),
            publisher: RwLock::default(),
        }
    }
}

/// In-process implementation of [`StorageClient`].
///
/// Cloning is cheap; clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<MemoryState>,
}

impl MemoryStore {
    /// Creates an empty store with pub/sub enabled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Failure injection
    // =========================================================================

    /// Queues an error returned by the next call to `method`.
    ///
    /// Queued errors are consumed in order before the call runs.
    pub fn inject_error(&self, method: StoreMethod, error: StoreError) {
        self.state.queued_errors.lock().entry(method).or_default().push_back(error);
    }

    /// Makes every call to `method` fail with `error` until cleared.
    pub fn fail_always(&self, method: StoreMethod, error: StoreError) {
        self.state.sticky_errors.lock().insert(method, error);
    }

    /// Clears queued and permanent errors for `method`.
    pub fn clear_errors(&self, method: StoreMethod) {
        self.state.queued_errors.lock().remove(&method);
        self.state.sticky_errors.lock().remove(&method);
    }

    /// Enables or disables pub/sub. While disabled, `listen` fails with
    /// `UnsupportedRpc`.
    pub fn set_listen_supported(&self, supported: bool) {
        self.state.listen_supported.store(supported, Ordering::SeqCst);
    }

    /// Delays every RPC by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.state.delay_ms.store(ms, Ordering::SeqCst);
    }

    /// Number of calls made to `method`, including failed ones.
    #[must_use]
    pub fn call_count(&self, method: StoreMethod) -> usize {
        self.state.calls[method.index()].load(Ordering::SeqCst)
    }

    async fn enter(&self, method: StoreMethod) -> StoreResult<()> {
        self.state.calls[method.index()].fetch_add(1, Ordering::SeqCst);
        let delay_ms = self.state.delay_ms.load(Ordering::SeqCst);
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        if let Some(error) =
            self.state.queued_errors.lock().get_mut(&method).and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        if let Some(error) = self.state.sticky_errors.lock().get(&method) {
            return Err(error.clone());
        }
        Ok(())
    }

    // =========================================================================
    // Pub/sub
    // =========================================================================

    /// Reports every committed put and delete to `publisher`.
    pub fn set_publisher(&self, publisher: Arc<dyn ChangePublisher>) {
        self.state.publisher.write().0 = Some(publisher);
    }

    fn publish(&self, events: Vec<ChangeEvent>) {
        let Some(publisher) = self.state.publisher.read().0.clone() else {
            return;
        };
        for event in events {
            publisher.publish(event);
        }
    }

    /// Publishes `payload` to every live subscriber of `topic`.
    ///
    /// Returns the number of subscribers the payload was delivered to.
    pub fn notify(&self, topic: &str, payload: Value) -> usize {
        let mut topics = self.state.topics.lock();
        let Some(senders) = topics.get_mut(topic) else {
            return 0;
        };
        senders.retain(|sender| sender.send(Ok(payload.clone())).is_ok());
        senders.len()
    }

    /// Ends every subscription on `topic`, delivering `error` first if set.
    pub fn end_subscriptions(&self, topic: &str, error: Option<StoreError>) {
        let senders = self.state.topics.lock().remove(topic).unwrap_or_default();
        if let Some(error) = error {
            for sender in &senders {
                let _ = sender.send(Err(error.clone()));
            }
        }
    }

    /// Number of open subscriptions on `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        let mut topics = self.state.topics.lock();
        let Some(senders) = topics.get_mut(topic) else {
            return 0;
        };
        senders.retain(|sender| !sender.is_closed());
        senders.len()
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Snapshot of every object in `bucket`, ordered by key.
    #[must_use]
    pub fn objects(&self, bucket: &str) -> Vec<Record> {
        self.state
            .buckets
            .read()
            .get(bucket)
            .map(|state| {
                state.objects.iter().map(|(k, v)| Record::new(k.clone(), v.clone())).collect()
            })
            .unwrap_or_default()
    }
}

// =============================================================================
// Validation helpers
// =============================================================================

fn validate_descriptor(descriptor: &BucketDescriptor) -> StoreResult<()> {
    ensure!(
        !descriptor.name.is_empty(),
        InvalidBucketConfigSnafu { bucket: String::new(), message: "bucket name is empty" }
    );
    if let Some(field) = descriptor.index.keys().find(|f| f.is_empty() || f.as_str() == "_key") {
        return InvalidBucketConfigSnafu {
            bucket: descriptor.name.clone(),
            message: format!("reserved or empty index name {field:?}"),
        }
        .fail();
    }
    Ok(())
}

fn validate_record(bucket: &BucketState, record: &RecordValue) -> StoreResult<()> {
    for (field, definition) in &bucket.descriptor.index {
        match record.get(field) {
            None | Some(Value::Null) => {},
            Some(value) => ensure!(
                definition.index_type.accepts(value),
                InvalidIndexTypeSnafu {
                    bucket: bucket.descriptor.name.clone(),
                    field: field.clone(),
                    message: format!("value {value} is not of type {:?}", definition.index_type),
                }
            ),
        }
    }
    Ok(())
}

fn check_unique(
    bucket: &BucketState,
    objects: &BTreeMap<String, RecordValue>,
    key: &str,
    record: &RecordValue,
) -> StoreResult<()> {
    for (field, _) in bucket.descriptor.index.iter().filter(|(_, d)| d.unique) {
        let Some(value) = record.get(field).filter(|v| !v.is_null()) else {
            continue;
        };
        let collision = objects
            .iter()
            .any(|(other_key, other)| other_key != key && other.get(field) == Some(value));
        ensure!(
            !collision,
            UniqueAttributeSnafu {
                bucket: bucket.descriptor.name.clone(),
                field: field.clone(),
                value: value.to_string(),
            }
        );
    }
    Ok(())
}

fn bucket_not_found(name: &str) -> StoreError {
    BucketNotFoundSnafu { bucket: name }.build()
}

/// Builds the event for writing `record` over `previous`.
fn put_event(bucket: &str, previous: Option<&RecordValue>, record: &Record) -> ChangeEvent {
    let changed_fields = match previous {
        None => record.value.keys().cloned().collect(),
        Some(previous) => previous
            .keys()
            .chain(record.value.keys())
            .filter(|field| previous.get(*field) != record.value.get(*field))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect(),
    };
    ChangeEvent { bucket: bucket.to_string(), key: record.key.clone(), kind: ChangeKind::Put, changed_fields }
}

#[async_trait]
impl StorageClient for MemoryStore {
    async fn get_bucket(&self, name: &str) -> StoreResult<StoredBucket> {
        self.enter(StoreMethod::GetBucket).await?;
        let buckets = self.state.buckets.read();
        let bucket = buckets.get(name).ok_or_else(|| bucket_not_found(name))?;
        Ok(StoredBucket {
            descriptor: bucket.descriptor.clone(),
            reindex_pending: bucket.reindex_remaining > 0,
        })
    }

    async fn create_bucket(&self, descriptor: &BucketDescriptor) -> StoreResult<()> {
        self.enter(StoreMethod::CreateBucket).await?;
        validate_descriptor(descriptor)?;
        let mut buckets = self.state.buckets.write();
        ensure!(
            !buckets.contains_key(&descriptor.name),
            InvalidBucketConfigSnafu {
                bucket: descriptor.name.clone(),
                message: "bucket already exists",
            }
        );
        buckets.insert(
            descriptor.name.clone(),
            BucketState {
                descriptor: descriptor.clone(),
                objects: BTreeMap::new(),
                reindex_remaining: 0,
            },
        );
        Ok(())
    }

    async fn update_bucket(&self, descriptor: &BucketDescriptor) -> StoreResult<()> {
        self.enter(StoreMethod::UpdateBucket).await?;
        validate_descriptor(descriptor)?;
        let mut buckets = self.state.buckets.write();
        let bucket =
            buckets.get_mut(&descriptor.name).ok_or_else(|| bucket_not_found(&descriptor.name))?;

        let stored = bucket.descriptor.version;
        ensure!(
            descriptor.version >= stored,
            BucketVersionSnafu {
                bucket: descriptor.name.clone(),
                stored,
                requested: descriptor.version,
            }
        );
        for (field, definition) in &descriptor.index {
            if let Some(existing) = bucket.descriptor.index.get(field) {
                ensure!(
                    existing.index_type == definition.index_type,
                    InvalidIndexTypeSnafu {
                        bucket: descriptor.name.clone(),
                        field: field.clone(),
                        message: format!(
                            "cannot change index type from {:?} to {:?}",
                            existing.index_type, definition.index_type
                        ),
                    }
                );
            }
        }

        if descriptor.version > stored {
            bucket.reindex_remaining = bucket.objects.len();
        }
        bucket.descriptor = descriptor.clone();
        Ok(())
    }

    async fn reindex_bucket(&self, name: &str, batch_size: u32) -> StoreResult<ReindexResult> {
        self.enter(StoreMethod::ReindexBucket).await?;
        let mut buckets = self.state.buckets.write();
        let bucket = buckets.get_mut(name).ok_or_else(|| bucket_not_found(name))?;
        let batch = usize::try_from(batch_size).unwrap_or(usize::MAX);
        let processed = bucket.reindex_remaining.min(batch);
        bucket.reindex_remaining -= processed;
        Ok(ReindexResult {
            processed: processed as u64,
            completed: bucket.reindex_remaining == 0,
        })
    }

    async fn get_object(&self, bucket: &str, key: &str) -> StoreResult<Record> {
        self.enter(StoreMethod::GetObject).await?;
        let buckets = self.state.buckets.read();
        let state = buckets.get(bucket).ok_or_else(|| bucket_not_found(bucket))?;
        let value = state
            .objects
            .get(key)
            .ok_or_else(|| ObjectNotFoundSnafu { bucket, key }.build())?;
        Ok(Record::new(key, value.clone()))
    }

    async fn put_object(&self, bucket: &str, record: Record) -> StoreResult<()> {
        self.enter(StoreMethod::PutObject).await?;
        let mut buckets = self.state.buckets.write();
        let state = buckets.get_mut(bucket).ok_or_else(|| bucket_not_found(bucket))?;
        validate_record(state, &record.value)?;
        check_unique(state, &state.objects, &record.key, &record.value)?;
        let event = put_event(bucket, state.objects.get(&record.key), &record);
        state.objects.insert(record.key, record.value);
        drop(buckets);
        self.publish(vec![event]);
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> StoreResult<()> {
        self.enter(StoreMethod::DeleteObject).await?;
        let mut buckets = self.state.buckets.write();
        let state = buckets.get_mut(bucket).ok_or_else(|| bucket_not_found(bucket))?;
        if state.objects.remove(key).is_none() {
            return ObjectNotFoundSnafu { bucket, key }.fail();
        }
        drop(buckets);
        self.publish(vec![ChangeEvent {
            bucket: bucket.to_string(),
            key: key.to_string(),
            kind: ChangeKind::Delete,
            changed_fields: Vec::new(),
        }]);
        Ok(())
    }

    async fn find_objects(&self, bucket: &str, query: &FindQuery) -> StoreResult<Vec<Record>> {
        self.enter(StoreMethod::FindObjects).await?;
        ensure!(
            query.limit > 0,
            InvalidQuerySnafu { bucket, message: "limit must be greater than zero" }
        );
        let buckets = self.state.buckets.read();
        let state = buckets.get(bucket).ok_or_else(|| bucket_not_found(bucket))?;
        if let Some(field) = query.fields().into_iter().find(|f| !state.descriptor.is_indexed(f)) {
            return NotIndexedSnafu { bucket, field }.fail();
        }

        let mut matched: Vec<(&String, &RecordValue)> =
            state.objects.iter().filter(|(_, value)| query.filter.matches(value)).collect();
        // Stable sort keeps key order as the final tie-break.
        matched.sort_by(|(_, a), (_, b)| compare_records(&query.sort, a, b));

        Ok(matched
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .map(|(key, value)| Record::new(key.clone(), value.clone()))
            .collect())
    }

    async fn put_batch(&self, bucket: &str, records: Vec<Record>) -> StoreResult<()> {
        self.enter(StoreMethod::PutBatch).await?;
        let mut buckets = self.state.buckets.write();
        let state = buckets.get_mut(bucket).ok_or_else(|| bucket_not_found(bucket))?;

        // Apply to a copy so a failing record leaves the bucket untouched.
        let mut staged = state.objects.clone();
        let mut events = Vec::with_capacity(records.len());
        for record in records {
            validate_record(state, &record.value)?;
            check_unique(state, &staged, &record.key, &record.value)?;
            events.push(put_event(bucket, staged.get(&record.key), &record));
            staged.insert(record.key, record.value);
        }
        state.objects = staged;
        drop(buckets);
        self.publish(events);
        Ok(())
    }

    async fn listen(&self, topic: &str) -> StoreResult<Subscription> {
        self.enter(StoreMethod::Listen).await?;
        ensure!(
            self.state.listen_supported.load(Ordering::SeqCst),
            UnsupportedRpcSnafu { method: "listen" }
        );
        let (sender, receiver) = mpsc::unbounded_channel();
        self.state.topics.lock().entry(topic.to_string()).or_default().push(sender);
        tracing::debug!(topic, "Subscription opened");
        Ok(Subscription::new(topic, receiver))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use serde_json::json;
    use vm_inventory_types::{IndexDefinition, IndexType, StoreErrorKind};

    use super::*;
    use crate::query::{Filter, SortKey};

    fn vms_bucket(version: u32) -> BucketDescriptor {
        BucketDescriptor::new("vms", version)
            .with_index("uuid", IndexDefinition::string().unique())
            .with_index("state", IndexDefinition::string())
            .with_index("ram", IndexDefinition::number())
    }

    fn vm(uuid: &str, state: &str, ram: u64) -> Record {
        Record::from_json(uuid, json!({"uuid": uuid, "state": state, "ram": ram}))
    }

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store.create_bucket(&vms_bucket(1)).await.unwrap();
        store.put_object("vms", vm("a", "running", 256)).await.unwrap();
        store.put_object("vms", vm("b", "stopped", 1024)).await.unwrap();
        store.put_object("vms", vm("c", "running", 512)).await.unwrap();
        store
    }

    // =========================================================================
    // Buckets
    // =========================================================================

    #[tokio::test]
    async fn test_get_missing_bucket() {
        let store = MemoryStore::new();
        let err = store.get_bucket("vms").await.unwrap_err();
        assert_eq!(err.kind(), StoreErrorKind::BucketNotFound);
    }

    #[tokio::test]
    async fn test_create_twice_rejected() {
        let store = MemoryStore::new();
        store.create_bucket(&vms_bucket(1)).await.unwrap();
        let err = store.create_bucket(&vms_bucket(1)).await.unwrap_err();
        assert_eq!(err.kind(), StoreErrorKind::InvalidBucketConfig);
    }

    #[tokio::test]
    async fn test_update_rejects_version_regression() {
        let store = MemoryStore::new();
        store.create_bucket(&vms_bucket(2)).await.unwrap();
        let err = store.update_bucket(&vms_bucket(1)).await.unwrap_err();
        assert_eq!(err.kind(), StoreErrorKind::BucketVersion);
        assert_eq!(store.get_bucket("vms").await.unwrap().descriptor.version, 2);
    }

    #[tokio::test]
    async fn test_update_rejects_index_type_change() {
        let store = MemoryStore::new();
        store.create_bucket(&vms_bucket(1)).await.unwrap();
        let changed =
            vms_bucket(2).with_index("ram", IndexDefinition::new(IndexType::String));
        let err = store.update_bucket(&changed).await.unwrap_err();
        assert_eq!(err.kind(), StoreErrorKind::InvalidIndexType);
    }

    #[tokio::test]
    async fn test_version_bump_marks_objects_for_reindex() {
        let store = seeded().await;
        store.update_bucket(&vms_bucket(2)).await.unwrap();
        assert!(store.get_bucket("vms").await.unwrap().reindex_pending);

        let first = store.reindex_bucket("vms", 2).await.unwrap();
        assert_eq!(first, ReindexResult { processed: 2, completed: false });
        let second = store.reindex_bucket("vms", 2).await.unwrap();
        assert_eq!(second, ReindexResult { processed: 1, completed: true });
        assert!(!store.get_bucket("vms").await.unwrap().reindex_pending);
    }

    // =========================================================================
    // Objects
    // =========================================================================

    #[tokio::test]
    async fn test_unique_index_enforced() {
        let store = seeded().await;
        let dup = Record::from_json("z", json!({"uuid": "a", "state": "running"}));
        let err = store.put_object("vms", dup).await.unwrap_err();
        assert_eq!(err.kind(), StoreErrorKind::UniqueAttributeViolation);
    }

    #[tokio::test]
    async fn test_index_type_enforced_on_write() {
        let store = seeded().await;
        let bad = Record::from_json("d", json!({"uuid": "d", "ram": "lots"}));
        let err = store.put_object("vms", bad).await.unwrap_err();
        assert_eq!(err.kind(), StoreErrorKind::InvalidIndexType);
    }

    #[tokio::test]
    async fn test_put_batch_is_atomic() {
        let store = seeded().await;
        let batch = vec![
            vm("d", "running", 1),
            Record::from_json("e", json!({"uuid": "a"})),
        ];
        let err = store.put_batch("vms", batch).await.unwrap_err();
        assert_eq!(err.kind(), StoreErrorKind::UniqueAttributeViolation);
        assert_eq!(store.objects("vms").len(), 3);
    }

    #[tokio::test]
    async fn test_delete_missing_object() {
        let store = seeded().await;
        store.delete_object("vms", "a").await.unwrap();
        let err = store.delete_object("vms", "a").await.unwrap_err();
        assert_eq!(err.kind(), StoreErrorKind::ObjectNotFound);
    }

    // =========================================================================
    // Search
    // =========================================================================

    #[tokio::test]
    async fn test_find_filters_sorts_and_limits() {
        let store = seeded().await;
        let query = FindQuery::new(Filter::eq("state", "running"))
            .with_sort(SortKey::desc("ram"))
            .with_limit(1);
        let found = store.find_objects("vms", &query).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].key, "c");
    }

    #[tokio::test]
    async fn test_find_offset() {
        let store = seeded().await;
        let query = FindQuery::new(Filter::All).with_sort(SortKey::asc("ram")).with_offset(1);
        let keys: Vec<_> =
            store.find_objects("vms", &query).await.unwrap().into_iter().map(|r| r.key).collect();
        assert_eq!(keys, vec!["c", "b"]);
    }

    #[tokio::test]
    async fn test_find_on_unindexed_field_rejected() {
        let store = seeded().await;
        let query = FindQuery::new(Filter::eq("alias", "web"));
        let err = store.find_objects("vms", &query).await.unwrap_err();
        assert_eq!(err.kind(), StoreErrorKind::NotIndexed);

        let query = FindQuery::new(Filter::All).with_sort(SortKey::asc("alias"));
        let err = store.find_objects("vms", &query).await.unwrap_err();
        assert_eq!(err.kind(), StoreErrorKind::NotIndexed);
    }

    // =========================================================================
    // Failure injection
    // =========================================================================

    #[tokio::test]
    async fn test_injected_errors_consumed_in_order() {
        let store = MemoryStore::new();
        store.inject_error(StoreMethod::GetBucket, StoreError::connection("reset"));
        store.inject_error(StoreMethod::GetBucket, StoreError::NoDatabasePeers);

        let first = store.get_bucket("vms").await.unwrap_err();
        assert_eq!(first.kind(), StoreErrorKind::Connection);
        let second = store.get_bucket("vms").await.unwrap_err();
        assert_eq!(second.kind(), StoreErrorKind::NoDatabasePeers);
        let third = store.get_bucket("vms").await.unwrap_err();
        assert_eq!(third.kind(), StoreErrorKind::BucketNotFound);
        assert_eq!(store.call_count(StoreMethod::GetBucket), 3);
    }

    #[tokio::test]
    async fn test_fail_always_until_cleared() {
        let store = seeded().await;
        store.fail_always(StoreMethod::GetObject, StoreError::NoDatabasePeers);
        assert!(store.get_object("vms", "a").await.is_err());
        assert!(store.get_object("vms", "a").await.is_err());
        store.clear_errors(StoreMethod::GetObject);
        assert_eq!(store.get_object("vms", "a").await.unwrap().key, "a");
    }

    // =========================================================================
    // Pub/sub
    // =========================================================================

    #[tokio::test]
    async fn test_listen_and_notify() {
        let store = MemoryStore::new();
        let mut sub = store.listen("jobs").await.unwrap();
        assert_eq!(store.notify("jobs", json!({"n": 1})), 1);
        assert_eq!(sub.recv().await.unwrap().unwrap(), json!({"n": 1}));
    }

    #[tokio::test]
    async fn test_dropped_subscription_unlistens() {
        let store = MemoryStore::new();
        let sub = store.listen("jobs").await.unwrap();
        assert_eq!(store.subscriber_count("jobs"), 1);
        drop(sub);
        assert_eq!(store.subscriber_count("jobs"), 0);
        assert_eq!(store.notify("jobs", json!(null)), 0);
    }

    #[tokio::test]
    async fn test_listen_unsupported() {
        let store = MemoryStore::new();
        store.set_listen_supported(false);
        let err = store.listen("jobs").await.unwrap_err();
        assert_eq!(err.kind(), StoreErrorKind::UnsupportedRpc);
    }

    #[tokio::test]
    async fn test_end_subscriptions_delivers_error_then_ends() {
        let store = MemoryStore::new();
        let mut sub = store.listen("jobs").await.unwrap();
        store.end_subscriptions("jobs", Some(StoreError::connection("closed")));
        assert!(sub.recv().await.unwrap().is_err());
        assert!(sub.recv().await.is_none());
    }

    // =========================================================================
    // Change feed
    // =========================================================================

    #[tokio::test]
    async fn test_committed_writes_are_published() {
        let store = seeded().await;
        let publisher = crate::BroadcastPublisher::new(16);
        let mut changes = publisher.subscribe();
        store.set_publisher(Arc::new(publisher));

        store.put_object("vms", vm("a", "stopped", 256)).await.unwrap();
        let event = changes.recv().await.unwrap();
        assert_eq!(event.key, "a");
        assert_eq!(event.kind, ChangeKind::Put);
        assert_eq!(event.changed_fields, vec!["state".to_string()]);

        store.delete_object("vms", "b").await.unwrap();
        let event = changes.recv().await.unwrap();
        assert_eq!((event.key.as_str(), event.kind), ("b", ChangeKind::Delete));
    }

    #[tokio::test]
    async fn test_rejected_batch_publishes_nothing() {
        let store = seeded().await;
        let publisher = crate::BroadcastPublisher::new(16);
        let mut changes = publisher.subscribe();
        store.set_publisher(Arc::new(publisher));

        // "d" collides with "a" on the unique uuid index.
        let batch = vec![
            vm("e", "running", 1),
            Record::from_json("d", json!({"uuid": "a", "state": "running", "ram": 1})),
        ];
        assert!(store.put_batch("vms", batch).await.is_err());
        assert!(changes.try_recv().is_err());
    }
}
