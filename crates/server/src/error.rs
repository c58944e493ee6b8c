//! Server error types.

use std::{path::PathBuf, sync::Arc};

use snafu::Snafu;

/// Result type alias for the server.
pub type Result<T, E = ServerError> = std::result::Result<T, E>;

/// Failures that stop the server.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ServerError {
    /// The configuration could not be read or deserialized.
    #[snafu(display("failed to load config: {source}"))]
    LoadConfig {
        /// Configuration file, if one was given.
        path: Option<PathBuf>,
        /// Underlying error.
        source: ::config::ConfigError,
    },

    /// A configuration value is out of range.
    #[snafu(display("{source}"))]
    ValidateConfig {
        /// Underlying error.
        source: vm_inventory_types::config::ConfigError,
    },

    /// The configuration schema could not be rendered.
    #[snafu(display("failed to render config: {source}"))]
    Schema {
        /// Underlying error.
        source: serde_json::Error,
    },

    /// Bucket setup or reindex failed permanently.
    #[snafu(display("bucket initialization failed: {source}"))]
    BucketInit {
        /// Startup error shared with every waiter.
        source: Arc<vm_inventory_control::Error>,
    },
}
