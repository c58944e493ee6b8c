//! Store error taxonomy using snafu.
//!
//! Every error returned by a [`StorageClient`] implementation is a
//! [`StoreError`]. Each variant maps to a [`StoreErrorKind`] which carries the
//! default retryability classification and a stable name used in diagnostics
//! and in the fixed deny-lists of the control-plane retry loops.
//!
//! [`StorageClient`]: https://docs.rs/vm-inventory-store

use core::fmt;

use snafu::Snafu;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Machine-readable error kinds for store errors.
///
/// | Kind                       | Transient | Typical cause                         |
/// |----------------------------|-----------|---------------------------------------|
/// | `BucketNotFound`           | no        | bucket was never created              |
/// | `BucketVersion`            | no        | update requested a lower version      |
/// | `InvalidBucketConfig`      | no        | malformed bucket definition           |
/// | `InvalidIndexType`         | no        | unknown or incompatible index type    |
/// | `InvalidQuery`             | no        | malformed filter or sort              |
/// | `NotIndexed`               | no        | filter/sort on an unindexed field     |
/// | `UniqueAttributeViolation` | no        | unique index collision                |
/// | `ObjectNotFound`           | no        | key does not exist                    |
/// | `UnsupportedRpc`           | no        | server lacks the requested primitive  |
/// | `Connection`               | yes       | socket closed, connect refused        |
/// | `NoDatabasePeers`          | yes       | store has no healthy backend          |
/// | `Overloaded`               | yes       | store shedding load                   |
/// | `Timeout`                  | yes       | request deadline elapsed              |
/// | `Internal`                 | yes       | unexpected server-side failure        |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StoreErrorKind {
    /// The named bucket does not exist.
    BucketNotFound,
    /// A bucket update requested a version lower than the stored one.
    BucketVersion,
    /// The bucket definition is malformed.
    InvalidBucketConfig,
    /// An index type is unknown or conflicts with the stored index.
    InvalidIndexType,
    /// A query is malformed.
    InvalidQuery,
    /// A query references a field that is not indexed.
    NotIndexed,
    /// A write collides with an existing value of a unique index.
    UniqueAttributeViolation,
    /// The requested object does not exist.
    ObjectNotFound,
    /// The remote side does not implement the requested RPC.
    UnsupportedRpc,
    /// The connection to the store failed or was closed.
    Connection,
    /// The store has no database peers available.
    NoDatabasePeers,
    /// The store is shedding load.
    Overloaded,
    /// The request timed out.
    Timeout,
    /// Unexpected server-side failure.
    Internal,
}

impl StoreErrorKind {
    /// Returns true if an operation failing with this kind is likely to succeed
    /// when retried without intervention.
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Connection
                | Self::NoDatabasePeers
                | Self::Overloaded
                | Self::Timeout
                | Self::Internal
        )
    }

    /// Returns the stable error name used in logs and health reports.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::BucketNotFound => "BucketNotFoundError",
            Self::BucketVersion => "BucketVersionError",
            Self::InvalidBucketConfig => "InvalidBucketConfigError",
            Self::InvalidIndexType => "InvalidIndexTypeError",
            Self::InvalidQuery => "InvalidQueryError",
            Self::NotIndexed => "NotIndexedError",
            Self::UniqueAttributeViolation => "UniqueAttributeError",
            Self::ObjectNotFound => "ObjectNotFoundError",
            Self::UnsupportedRpc => "UnsupportedRpcError",
            Self::Connection => "ConnectionError",
            Self::NoDatabasePeers => "NoDatabasePeersError",
            Self::Overloaded => "OverloadedError",
            Self::Timeout => "TimeoutError",
            Self::Internal => "InternalError",
        }
    }
}

impl fmt::Display for StoreErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors returned by the key/value store.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub))]
pub enum StoreError {
    /// The named bucket does not exist.
    #[snafu(display("bucket {bucket} does not exist"))]
    BucketNotFound {
        /// Bucket name.
        bucket: String,
    },

    /// A bucket update requested a lower version than the stored one.
    #[snafu(display(
        "bucket {bucket} is at version {stored}, refusing update to version {requested}"
    ))]
    BucketVersion {
        /// Bucket name.
        bucket: String,
        /// Version currently stored.
        stored: u32,
        /// Version requested by the update.
        requested: u32,
    },

    /// The bucket definition is malformed.
    #[snafu(display("invalid configuration for bucket {bucket}: {message}"))]
    InvalidBucketConfig {
        /// Bucket name.
        bucket: String,
        /// Error description.
        message: String,
    },

    /// An index type is unknown or conflicts with the stored index.
    #[snafu(display("invalid index type for {bucket}.{field}: {message}"))]
    InvalidIndexType {
        /// Bucket name.
        bucket: String,
        /// Indexed field.
        field: String,
        /// Error description.
        message: String,
    },

    /// A query is malformed.
    #[snafu(display("invalid query on bucket {bucket}: {message}"))]
    InvalidQuery {
        /// Bucket name.
        bucket: String,
        /// Error description.
        message: String,
    },

    /// A query references a field that is not indexed.
    #[snafu(display("field {field} is not indexed in bucket {bucket}"))]
    NotIndexed {
        /// Bucket name.
        bucket: String,
        /// Unindexed field.
        field: String,
    },

    /// A write collides with an existing value of a unique index.
    #[snafu(display("unique attribute {field}={value} already exists in bucket {bucket}"))]
    UniqueAttribute {
        /// Bucket name.
        bucket: String,
        /// Unique field.
        field: String,
        /// Colliding value.
        value: String,
    },

    /// The requested object does not exist.
    #[snafu(display("object {key} does not exist in bucket {bucket}"))]
    ObjectNotFound {
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
    },

    /// The remote side does not implement the requested RPC.
    #[snafu(display("RPC {method} is not supported by the store"))]
    UnsupportedRpc {
        /// RPC method name.
        method: String,
    },

    /// The connection to the store failed or was closed.
    #[snafu(display("store connection error: {message}"))]
    Connection {
        /// Error description.
        message: String,
    },

    /// The store has no database peers available.
    #[snafu(display("store has no database peers available"))]
    NoDatabasePeers,

    /// The store is shedding load.
    #[snafu(display("store overloaded: {message}"))]
    Overloaded {
        /// Error description.
        message: String,
    },

    /// The request timed out.
    #[snafu(display("store request timed out after {duration_ms}ms"))]
    Timeout {
        /// Elapsed time in milliseconds.
        duration_ms: u64,
    },

    /// Unexpected server-side failure.
    #[snafu(display("store internal error: {message}"))]
    Internal {
        /// Error description.
        message: String,
    },
}

impl StoreError {
    /// Returns the machine-readable kind of this error.
    #[must_use]
    pub const fn kind(&self) -> StoreErrorKind {
        match self {
            Self::BucketNotFound { .. } => StoreErrorKind::BucketNotFound,
            Self::BucketVersion { .. } => StoreErrorKind::BucketVersion,
            Self::InvalidBucketConfig { .. } => StoreErrorKind::InvalidBucketConfig,
            Self::InvalidIndexType { .. } => StoreErrorKind::InvalidIndexType,
            Self::InvalidQuery { .. } => StoreErrorKind::InvalidQuery,
            Self::NotIndexed { .. } => StoreErrorKind::NotIndexed,
            Self::UniqueAttribute { .. } => StoreErrorKind::UniqueAttributeViolation,
            Self::ObjectNotFound { .. } => StoreErrorKind::ObjectNotFound,
            Self::UnsupportedRpc { .. } => StoreErrorKind::UnsupportedRpc,
            Self::Connection { .. } => StoreErrorKind::Connection,
            Self::NoDatabasePeers => StoreErrorKind::NoDatabasePeers,
            Self::Overloaded { .. } => StoreErrorKind::Overloaded,
            Self::Timeout { .. } => StoreErrorKind::Timeout,
            Self::Internal { .. } => StoreErrorKind::Internal,
        }
    }

    /// Returns true if the error is transient and the operation may be retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        self.kind().is_transient()
    }

    /// Shorthand for a connection error, mostly useful for failure injection.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into() }
    }
}
