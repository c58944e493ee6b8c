//! Key/value store access for the VM inventory data layer.
//!
//! The store is a remote service exposing bucket management, object
//! get/put/delete, indexed search, explicit reindexing, and an optional
//! publish/subscribe primitive. This crate provides:
//!
//! - [`StorageClient`]: the RPC contract every store backend implements
//! - [`query`]: the filter and sort model used by indexed search
//! - [`MemoryStore`]: a complete in-memory backend with failure injection
//! - [`StoreConnection`]: a shared connection caching the listen capability
//! - [`changefeed`]: the fire-and-forget change publisher contract
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use vm_inventory_store::{MemoryStore, StoreConnection};
//! use vm_inventory_types::{BucketDescriptor, IndexDefinition};
//!
//! # async fn example() -> vm_inventory_types::StoreResult<()> {
//! let store = MemoryStore::new();
//! let connection = StoreConnection::new(Arc::new(store));
//! let bucket = BucketDescriptor::new("vms", 1).with_index("uuid", IndexDefinition::string().unique());
//! connection.client().create_bucket(&bucket).await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod changefeed;
mod client;
mod connection;
mod memory;
pub mod query;

pub use changefeed::{BroadcastPublisher, ChangeEvent, ChangeKind, ChangePublisher};
pub use client::{ReindexResult, StorageClient, Subscription};
pub use connection::{ListenSupport, StoreConnection};
pub use memory::{MemoryStore, StoreMethod};
pub use query::{DEFAULT_FIND_LIMIT, Filter, FindQuery, SortKey, SortOrder};
