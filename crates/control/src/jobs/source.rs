//! Where job records are read from.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;
use vm_inventory_store::StoreConnection;
use vm_inventory_types::{JobRecord, StoreResult, error::InternalSnafu};

/// Bucket the workflow engine stores its jobs in.
pub const DEFAULT_JOBS_BUCKET: &str = "wf_jobs";

/// Read access to workflow job records.
#[async_trait]
pub trait JobSource: Send + Sync + 'static {
    /// Fetches the current record of a job.
    async fn fetch_job(&self, job_uuid: Uuid) -> StoreResult<JobRecord>;
}

/// [`JobSource`] reading job objects from a store bucket, keyed by UUID.
#[derive(Debug, Clone)]
pub struct BucketJobSource {
    connection: StoreConnection,
    bucket: String,
}

impl BucketJobSource {
    /// Reads jobs from [`DEFAULT_JOBS_BUCKET`].
    #[must_use]
    pub fn new(connection: StoreConnection) -> Self {
        Self::with_bucket(connection, DEFAULT_JOBS_BUCKET)
    }

    /// Reads jobs from `bucket`.
    #[must_use]
    pub fn with_bucket(connection: StoreConnection, bucket: impl Into<String>) -> Self {
        Self { connection, bucket: bucket.into() }
    }
}

#[async_trait]
impl JobSource for BucketJobSource {
    async fn fetch_job(&self, job_uuid: Uuid) -> StoreResult<JobRecord> {
        let record = self.connection.client().get_object(&self.bucket, &job_uuid.to_string()).await?;
        serde_json::from_value(Value::Object(record.value)).map_err(|e| {
            InternalSnafu { message: format!("malformed job {job_uuid} in {}: {e}", self.bucket) }
                .build()
        })
    }
}
