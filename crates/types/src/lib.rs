//! Core types, errors, and configuration for the VM inventory data layer.
//!
//! This crate provides the foundational types shared by the store client,
//! the control-plane components, and the server binary:
//! - Bucket descriptors and index schemas
//! - Stored records and their data version
//! - Workflow job records and job notifications
//! - The store error taxonomy with transient/fatal classification
//! - Configuration structs with validating builders

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod types;

// Re-export commonly used types at crate root
pub use error::{StoreError, StoreErrorKind, StoreResult};
pub use types::*;
