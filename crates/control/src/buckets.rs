//! Bucket schema reconciliation.
//!
//! [`BucketSchemaManager`] brings the store's buckets in line with the
//! descriptors the service was built with. Startup runs two phases, each
//! inside its own backoff loop:
//!
//! 1. **Setup**: create missing buckets and update buckets whose stored
//!    version is lower than the desired one. Updates merge indexes, so an
//!    index present in the store is never dropped.
//! 2. **Reindex**: drive the store's reindex RPC for every bucket whose
//!    version was bumped (or that still reports pending reindex work) until
//!    the store reports completion.
//!
//! Setup errors go through an injectable classifier; reindex errors are
//! always retried. The manager's status and last error can be read at any
//! time, including while a phase is backing off.

use std::{
    collections::BTreeSet,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::Instrument;
use vm_inventory_store::StoreConnection;
use vm_inventory_types::{
    BucketDescriptor, StoreError, StoreErrorKind, config::BucketSetupConfig,
};

use crate::{
    completion::CompletionSignal,
    error::Error,
    retry::{RetryError, retry_with_backoff},
};

/// Decides whether a setup error is worth retrying.
pub type TransientClassifier = Arc<dyn Fn(&StoreError) -> bool + Send + Sync>;

/// Shared startup outcome.
pub type StartOutcome = Result<(), Arc<Error>>;

/// Classifier used when none is supplied: infrastructure failures are
/// transient, schema problems are fatal.
#[must_use]
pub fn default_classifier() -> TransientClassifier {
    Arc::new(StoreError::is_transient)
}

/// Progress of bucket initialization.
///
/// Transitions: `NotStarted` → `Started` → `BucketsSetupDone` →
/// `BucketsReindexDone`, or `Failed` from `Started` / `BucketsSetupDone`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BucketInitStatus {
    /// `start` was not called yet.
    NotStarted = 0,
    /// The setup phase is running.
    Started = 1,
    /// Every bucket exists at its desired version; reindex is running.
    BucketsSetupDone = 2,
    /// Every bucket is fully reindexed.
    BucketsReindexDone = 3,
    /// A phase failed permanently.
    Failed = 4,
}

impl BucketInitStatus {
    fn from_u8(val: u8) -> Self {
        match val {
            1 => Self::Started,
            2 => Self::BucketsSetupDone,
            3 => Self::BucketsReindexDone,
            4 => Self::Failed,
            _ => Self::NotStarted,
        }
    }
}

impl fmt::Display for BucketInitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotStarted => "NOT_STARTED",
            Self::Started => "STARTED",
            Self::BucketsSetupDone => "BUCKETS_SETUP_DONE",
            Self::BucketsReindexDone => "BUCKETS_REINDEX_DONE",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

struct Inner {
    connection: StoreConnection,
    buckets: Vec<BucketDescriptor>,
    config: BucketSetupConfig,
    classifier: TransientClassifier,
    started: AtomicBool,
    status: AtomicU8,
    status_changes: watch::Sender<BucketInitStatus>,
    last_error: Mutex<Option<Arc<Error>>>,
    /// Buckets awaiting reindex, filled by setup and drained by reindex.
    reindex_targets: Mutex<BTreeSet<String>>,
    completion: CompletionSignal<StartOutcome>,
}

/// Reconciles stored bucket schemas with the desired descriptors.
///
/// Cloning is cheap; clones share state.
#[derive(Clone)]
pub struct BucketSchemaManager {
    inner: Arc<Inner>,
}

#[bon::bon]
impl BucketSchemaManager {
    /// Creates a manager. Nothing touches the store before [`start`](Self::start).
    #[builder]
    pub fn new(
        connection: StoreConnection,
        buckets: Vec<BucketDescriptor>,
        #[builder(default)] config: BucketSetupConfig,
        #[builder(default = default_classifier())] classifier: TransientClassifier,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                connection,
                buckets,
                config,
                classifier,
                started: AtomicBool::new(false),
                status: AtomicU8::new(BucketInitStatus::NotStarted as u8),
                status_changes: watch::Sender::new(BucketInitStatus::NotStarted),
                last_error: Mutex::new(None),
                reindex_targets: Mutex::new(BTreeSet::new()),
                completion: CompletionSignal::new(),
            }),
        }
    }
}

impl BucketSchemaManager {
    /// Starts setup then reindex in a background task.
    ///
    /// Idempotent: only the first call spawns work. Returns immediately;
    /// use [`wait`](Self::wait) for the outcome. Must be called from within
    /// a tokio runtime.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            tracing::debug!("Bucket manager already started");
            return;
        }
        self.inner.set_status(BucketInitStatus::Started);

        let inner = Arc::clone(&self.inner);
        let span = tracing::info_span!("bucket_init", buckets = inner.buckets.len());
        tokio::spawn(
            async move {
                let outcome = inner.run().await;
                inner.completion.complete(outcome);
            }
            .instrument(span),
        );
    }

    /// Waits for startup to finish.
    pub async fn wait(&self) -> StartOutcome {
        self.inner.completion.wait().await
    }

    /// Waits until every bucket exists at its desired version.
    ///
    /// Resolves as soon as setup is done, while reindex may still be
    /// running; buckets are usable from then on. Returns the startup error
    /// if either phase fails first.
    pub async fn wait_for_setup(&self) -> StartOutcome {
        let mut changes = self.inner.status_changes.subscribe();
        loop {
            match *changes.borrow_and_update() {
                BucketInitStatus::BucketsSetupDone | BucketInitStatus::BucketsReindexDone => {
                    return Ok(());
                },
                BucketInitStatus::Failed => return self.wait().await,
                BucketInitStatus::NotStarted | BucketInitStatus::Started => {},
            }
            if changes.changed().await.is_err() {
                return self.wait().await;
            }
        }
    }

    /// Startup outcome, if finished.
    #[must_use]
    pub fn outcome(&self) -> Option<StartOutcome> {
        self.inner.completion.get()
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> BucketInitStatus {
        self.inner.status()
    }

    /// Error of the most recent failed attempt, cleared when a phase
    /// succeeds.
    #[must_use]
    pub fn last_init_error(&self) -> Option<Arc<Error>> {
        self.inner.last_error.lock().clone()
    }

    /// Desired bucket descriptors.
    #[must_use]
    pub fn buckets(&self) -> &[BucketDescriptor] {
        &self.inner.buckets
    }
}

impl fmt::Debug for BucketSchemaManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BucketSchemaManager")
            .field("status", &self.status())
            .field("buckets", &self.inner.buckets.len())
            .finish()
    }
}

impl Inner {
    fn status(&self) -> BucketInitStatus {
        BucketInitStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: BucketInitStatus) {
        tracing::info!(%status, "Bucket init status changed");
        self.status.store(status as u8, Ordering::Release);
        self.status_changes.send_replace(status);
    }

    fn record_failure(&self, error: Arc<Error>) {
        *self.last_error.lock() = Some(error);
    }

    fn clear_failure(&self) {
        *self.last_error.lock() = None;
    }

    async fn run(&self) -> StartOutcome {
        let classifier = Arc::clone(&self.classifier);
        let setup = retry_with_backoff(
            &self.config.setup_backoff,
            "bucket setup",
            |e: &Arc<Error>| e.store_error().is_some_and(|s| classifier(s)),
            |e, _| self.record_failure(Arc::clone(e)),
            || self.setup_all(),
        )
        .await;
        if let Err(err) = setup {
            return Err(self.fail("bucket setup", err));
        }
        self.clear_failure();
        self.set_status(BucketInitStatus::BucketsSetupDone);

        let reindex = retry_with_backoff(
            &self.config.reindex_backoff,
            "bucket reindex",
            |_: &Arc<Error>| true,
            |e, _| self.record_failure(Arc::clone(e)),
            || self.reindex_all(),
        )
        .await;
        if let Err(err) = reindex {
            return Err(self.fail("bucket reindex", err));
        }
        self.clear_failure();
        self.set_status(BucketInitStatus::BucketsReindexDone);
        Ok(())
    }

    fn fail(&self, phase: &'static str, err: RetryError<Arc<Error>>) -> Arc<Error> {
        let error = match err {
            RetryError::Fatal { attempts, error } => {
                Error::Fatal { phase, attempts, source: error }
            },
            RetryError::Exhausted { attempts, error } => {
                Error::RetryExhausted { phase, attempts, source: error }
            },
        };
        let error = Arc::new(error);
        self.record_failure(Arc::clone(&error));
        self.set_status(BucketInitStatus::Failed);
        error
    }

    async fn setup_all(&self) -> Result<(), Arc<Error>> {
        for bucket in &self.buckets {
            self.setup_bucket(bucket).await.map_err(Arc::new)?;
        }
        Ok(())
    }

    async fn setup_bucket(&self, desired: &BucketDescriptor) -> Result<(), Error> {
        let client = self.connection.client();
        let name = desired.name.as_str();
        let bucket_error = |operation: &'static str| {
            move |source: StoreError| Error::Bucket { bucket: name.to_string(), operation, source }
        };

        let stored = match client.get_bucket(name).await {
            Ok(stored) => stored,
            Err(e) if e.kind() == StoreErrorKind::BucketNotFound => {
                client.create_bucket(desired).await.map_err(bucket_error("create"))?;
                tracing::info!(bucket = name, version = desired.version, "Created bucket");
                return Ok(());
            },
            Err(e) => return Err(bucket_error("get")(e)),
        };

        let stored_version = stored.descriptor.version;
        if stored_version < desired.version {
            let update = BucketDescriptor {
                name: desired.name.clone(),
                index: desired.merged_index(&stored.descriptor),
                version: desired.version,
            };
            client.update_bucket(&update).await.map_err(bucket_error("update"))?;
            tracing::info!(
                bucket = name,
                from = stored_version,
                to = desired.version,
                "Updated bucket"
            );
            self.reindex_targets.lock().insert(desired.name.clone());
        } else if stored_version > desired.version {
            tracing::warn!(
                bucket = name,
                stored = stored_version,
                desired = desired.version,
                "Stored bucket is newer than this build, leaving it untouched"
            );
        } else if stored.descriptor.index != desired.index {
            tracing::warn!(
                bucket = name,
                version = stored_version,
                "Bucket schema differs at the same version, leaving it untouched"
            );
        }

        if stored.reindex_pending {
            self.reindex_targets.lock().insert(desired.name.clone());
        }
        Ok(())
    }

    async fn reindex_all(&self) -> Result<(), Arc<Error>> {
        let targets: Vec<String> = self.reindex_targets.lock().iter().cloned().collect();
        for bucket in targets {
            self.reindex_bucket(&bucket).await.map_err(Arc::new)?;
            self.reindex_targets.lock().remove(&bucket);
        }
        Ok(())
    }

    async fn reindex_bucket(&self, bucket: &str) -> Result<(), Error> {
        let client = self.connection.client();
        let mut total: u64 = 0;
        loop {
            let result = client
                .reindex_bucket(bucket, self.config.reindex_batch_size)
                .await
                .map_err(|source| Error::Bucket {
                    bucket: bucket.to_string(),
                    operation: "reindex",
                    source,
                })?;
            total += result.processed;
            if result.completed {
                tracing::info!(bucket, processed = total, "Reindexed bucket");
                return Ok(());
            }
            tracing::debug!(bucket, processed = total, "Reindex in progress");
        }
    }
}
