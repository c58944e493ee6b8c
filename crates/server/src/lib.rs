//! VM inventory data layer service.
//!
//! Provides configuration loading, the startup pipeline over the store, and
//! shutdown handling for the `vm-inventory` binary.

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod service;
pub mod shutdown;

pub use error::{Result, ServerError};
pub use service::Service;
