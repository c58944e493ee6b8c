//! Store RPC contract.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use vm_inventory_types::{BucketDescriptor, Record, StoreResult, StoredBucket};

use crate::query::FindQuery;

/// Progress reported by one reindex RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReindexResult {
    /// Objects reindexed by this call.
    pub processed: u64,
    /// True once no object in the bucket awaits reindexing.
    pub completed: bool,
}

/// RPC interface to the key/value store.
///
/// Implementations are shared across tasks behind an `Arc` and must not
/// hold locks across suspension points.
#[async_trait]
pub trait StorageClient: Send + Sync + 'static {
    /// Returns the stored bucket, or `BucketNotFound`.
    async fn get_bucket(&self, name: &str) -> StoreResult<StoredBucket>;

    /// Creates a bucket.
    async fn create_bucket(&self, descriptor: &BucketDescriptor) -> StoreResult<()>;

    /// Replaces a bucket's index and version.
    ///
    /// Fails with `BucketVersion` if the stored version is higher than the
    /// requested one.
    async fn update_bucket(&self, descriptor: &BucketDescriptor) -> StoreResult<()>;

    /// Reindexes up to `batch_size` objects written under an older schema.
    async fn reindex_bucket(&self, name: &str, batch_size: u32) -> StoreResult<ReindexResult>;

    /// Returns one object, or `ObjectNotFound`.
    async fn get_object(&self, bucket: &str, key: &str) -> StoreResult<Record>;

    /// Writes one object.
    async fn put_object(&self, bucket: &str, record: Record) -> StoreResult<()>;

    /// Deletes one object, or fails with `ObjectNotFound`.
    async fn delete_object(&self, bucket: &str, key: &str) -> StoreResult<()>;

    /// Runs an indexed search.
    async fn find_objects(&self, bucket: &str, query: &FindQuery) -> StoreResult<Vec<Record>>;

    /// Writes several objects atomically.
    async fn put_batch(&self, bucket: &str, records: Vec<Record>) -> StoreResult<()>;

    /// Subscribes to a pub/sub topic.
    ///
    /// Backends without pub/sub support return `UnsupportedRpc`.
    async fn listen(&self, topic: &str) -> StoreResult<Subscription>;
}

/// A live subscription to one pub/sub topic.
///
/// Dropping the subscription, or calling [`close`](Self::close), unlistens.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    receiver: mpsc::UnboundedReceiver<StoreResult<Value>>,
}

impl Subscription {
    /// Wraps the receiving half of a backend's delivery channel.
    #[must_use]
    pub fn new(topic: impl Into<String>, receiver: mpsc::UnboundedReceiver<StoreResult<Value>>) -> Self {
        Self { topic: topic.into(), receiver }
    }

    /// Topic this subscription listens on.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Waits for the next payload.
    ///
    /// Returns `None` once the subscription ended, and `Some(Err(_))` if the
    /// backend reported a subscription failure.
    pub async fn recv(&mut self) -> Option<StoreResult<Value>> {
        self.receiver.recv().await
    }

    /// Stops receiving. Payloads already queued can still be drained.
    pub fn close(&mut self) {
        self.receiver.close();
    }
}
