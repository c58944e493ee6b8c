//! Control plane of the VM inventory data layer.
//!
//! This crate provides:
//! - [`BucketSchemaManager`]: creates, upgrades, and reindexes buckets at startup
//! - [`DataMigrationRunner`]: rewrites records to their latest data version
//! - [`MarkerPaginator`]: marker and sort validation plus page queries
//! - [`JobWaiter`]: waits for workflow jobs by polling and notifications
//! - [`ServiceHealth`]: health derived from startup progress
//! - [`catalog`]: the inventory's own buckets and migrations
//!
//! Startup runs bucket setup, then reindex, then data migrations. Both
//! startup components retry transient store failures with exponential
//! backoff (see [`retry`]) and publish their outcome through a
//! single-resolution completion signal.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod buckets;
pub mod catalog;
pub mod completion;
pub mod error;
pub mod health;
pub mod jobs;
pub mod migrations;
pub mod pagination;
pub mod retry;

pub use buckets::{BucketInitStatus, BucketSchemaManager, StartOutcome, TransientClassifier};
pub use completion::{CompletionSignal, OnceCallback};
pub use error::{Error, Result};
pub use health::{HealthReport, HealthStatus, ServiceHealth};
pub use jobs::{JobOutcome, JobWaiter, WaitOptions};
pub use migrations::{
    DataMigration, DataMigrationRunner, MigrationProgress, ModelMigrations, validate_migrations,
};
pub use pagination::{Marker, MarkerPaginator, ParsedMarker, SortCriteria};
pub use retry::{RetryError, retry_with_backoff};
