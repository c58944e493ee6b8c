//! Shared store connection.
//!
//! A [`StoreConnection`] wraps the store client shared by every component
//! and caches the result of negotiating the pub/sub capability. Once the
//! store rejects `listen` as unsupported, the connection stops offering it
//! for the rest of its lifetime.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
};

use vm_inventory_types::{StoreErrorKind, StoreResult, error::UnsupportedRpcSnafu};

use crate::client::{StorageClient, Subscription};

/// Pub/sub capability of the remote store, as observed on this connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenSupport {
    /// No `listen` call has completed yet.
    Unknown,
    /// A `listen` call succeeded.
    Supported,
    /// The store rejected `listen` as an unsupported RPC. Never reset.
    Unsupported,
}

impl ListenSupport {
    const fn to_u8(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Supported => 1,
            Self::Unsupported => 2,
        }
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Supported,
            2 => Self::Unsupported,
            _ => Self::Unknown,
        }
    }
}

/// Store client shared across components.
///
/// Cloning is cheap; clones share the client and the capability cache.
#[derive(Clone)]
pub struct StoreConnection {
    client: Arc<dyn StorageClient>,
    listen_support: Arc<AtomicU8>,
}

impl StoreConnection {
    /// Wraps a store client.
    #[must_use]
    pub fn new(client: Arc<dyn StorageClient>) -> Self {
        Self {
            client,
            listen_support: Arc::new(AtomicU8::new(ListenSupport::Unknown.to_u8())),
        }
    }

    /// The underlying client.
    #[must_use]
    pub fn client(&self) -> &Arc<dyn StorageClient> {
        &self.client
    }

    /// Cached pub/sub capability.
    #[must_use]
    pub fn listen_support(&self) -> ListenSupport {
        ListenSupport::from_u8(self.listen_support.load(Ordering::Acquire))
    }

    /// Subscribes to `topic`, short-circuiting once pub/sub is known to be
    /// unsupported.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedRpc` without contacting the store if an earlier
    /// call observed the store rejecting `listen`, or any error from the
    /// store.
    pub async fn listen(&self, topic: &str) -> StoreResult<Subscription> {
        if self.listen_support() == ListenSupport::Unsupported {
            return UnsupportedRpcSnafu { method: "listen" }.fail();
        }

        match self.client.listen(topic).await {
            Ok(subscription) => {
                let _ = self.listen_support.compare_exchange(
                    ListenSupport::Unknown.to_u8(),
                    ListenSupport::Supported.to_u8(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                Ok(subscription)
            },
            Err(error) => {
                if error.kind() == StoreErrorKind::UnsupportedRpc {
                    let previous = self
                        .listen_support
                        .swap(ListenSupport::Unsupported.to_u8(), Ordering::AcqRel);
                    if previous != ListenSupport::Unsupported.to_u8() {
                        tracing::warn!(
                            topic,
                            "Store does not support listen, disabling notifications"
                        );
                    }
                }
                Err(error)
            },
        }
    }
}

impl fmt::Debug for StoreConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConnection").field("listen_support", &self.listen_support()).finish()
    }
}
