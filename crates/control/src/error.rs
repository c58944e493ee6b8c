//! Control-plane error types.
//!
//! Store failures keep their [`StoreError`] as source so callers can still
//! classify them. Startup outcomes are shared between every waiter as
//! `Arc<Error>`.

use std::{collections::BTreeMap, sync::Arc};

use snafu::Snafu;
use uuid::Uuid;
use vm_inventory_types::{StoreError, StoreErrorKind};

/// Result type alias for control-plane operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the bucket manager, the migration runner, and job waits.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// A store call on one bucket failed.
    #[snafu(display("{operation} on bucket {bucket} failed: {source}"))]
    Bucket {
        /// Bucket name.
        bucket: String,
        /// Store operation that failed.
        operation: &'static str,
        /// Underlying store error.
        source: StoreError,
    },

    /// A store call made by a data migration failed.
    #[snafu(display("migration {version} of model {model} failed: {source}"))]
    Migration {
        /// Model name.
        model: String,
        /// Migration version.
        version: u32,
        /// Underlying store error.
        source: StoreError,
    },

    /// A phase hit an error its classifier treats as non-retryable.
    #[snafu(display("{phase} aborted after {attempts} attempt(s): {source}"))]
    Fatal {
        /// Phase name.
        phase: &'static str,
        /// Attempts made.
        attempts: u32,
        /// Last error.
        source: Arc<Error>,
    },

    /// A phase ran out of attempts.
    #[snafu(display("{phase} gave up after {attempts} attempt(s): {source}"))]
    RetryExhausted {
        /// Phase name.
        phase: &'static str,
        /// Attempts made.
        attempts: u32,
        /// Last error.
        source: Arc<Error>,
    },

    /// The registered data migrations are inconsistent.
    #[snafu(display("invalid data migrations: {}", problems.join("; ")))]
    InvalidMigrations {
        /// One message per problem found.
        problems: Vec<String>,
    },

    /// One or more models failed to migrate during a run.
    #[snafu(display("data migrations failed for model(s) {}", failures.keys().cloned().collect::<Vec<_>>().join(", ")))]
    MigrationsFailed {
        /// Error per failed model.
        failures: BTreeMap<String, Arc<Error>>,
    },

    /// A job did not reach a terminal state within the poll budget.
    #[snafu(display("job {job_uuid} did not finish after {attempts} poll(s)"))]
    JobTimeout {
        /// Job identifier.
        job_uuid: Uuid,
        /// Polls made.
        attempts: u32,
    },

    /// Fetching a job failed too many times in a row.
    #[snafu(display("fetching job {job_uuid} failed {errors} consecutive time(s): {source}"))]
    JobFetch {
        /// Job identifier.
        job_uuid: Uuid,
        /// Consecutive failures.
        errors: u32,
        /// Last store error.
        source: StoreError,
    },

    /// Unexpected internal failure.
    #[snafu(display("internal error: {message}"))]
    Internal {
        /// Error description.
        message: String,
    },
}

impl Error {
    /// Returns the innermost store error, if this error originates from the
    /// store.
    #[must_use]
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            Self::Bucket { source, .. }
            | Self::Migration { source, .. }
            | Self::JobFetch { source, .. } => Some(source),
            Self::Fatal { source, .. } | Self::RetryExhausted { source, .. } => {
                source.store_error()
            },
            _ => None,
        }
    }

    /// Returns the kind of the innermost store error.
    #[must_use]
    pub fn store_kind(&self) -> Option<StoreErrorKind> {
        self.store_error().map(StoreError::kind)
    }
}
