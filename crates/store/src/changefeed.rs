//! Change notifications for committed mutations.
//!
//! Higher layers publish a [`ChangeEvent`] after a mutation commits.
//! Publishing never blocks and never fails the mutation: events published
//! while nobody listens are dropped.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Kind of mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// Object created or updated.
    Put,
    /// Object deleted.
    Delete,
}

/// A committed change to one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Bucket the object lives in.
    pub bucket: String,
    /// Object key.
    pub key: String,
    /// Mutation kind.
    pub kind: ChangeKind,
    /// Top-level fields the mutation changed, if known.
    #[serde(default)]
    pub changed_fields: Vec<String>,
}

/// Fire-and-forget sink for change events.
pub trait ChangePublisher: Send + Sync {
    /// Publishes an event. Never blocks.
    fn publish(&self, event: ChangeEvent);
}

/// [`ChangePublisher`] fanning events out over a tokio broadcast channel.
///
/// Slow subscribers lag and lose the oldest events rather than slowing
/// publishers down.
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    sender: broadcast::Sender<ChangeEvent>,
}

impl BroadcastPublisher {
    /// Creates a publisher buffering up to `capacity` events per subscriber.
    ///
    /// A zero capacity is raised to one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribes to events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl ChangePublisher for BroadcastPublisher {
    fn publish(&self, event: ChangeEvent) {
        if let Err(broadcast::error::SendError(event)) = self.sender.send(event) {
            tracing::trace!(bucket = %event.bucket, key = %event.key, "No change subscribers");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn event(key: &str) -> ChangeEvent {
        ChangeEvent {
            bucket: "vms".to_string(),
            key: key.to_string(),
            kind: ChangeKind::Put,
            changed_fields: vec!["state".to_string()],
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let publisher = BroadcastPublisher::new(8);
        let mut first = publisher.subscribe();
        let mut second = publisher.subscribe();
        publisher.publish(event("a"));
        assert_eq!(first.recv().await.unwrap().key, "a");
        assert_eq!(second.recv().await.unwrap().key, "a");
    }

    #[test]
    fn test_publish_without_subscribers_is_dropped() {
        let publisher = BroadcastPublisher::new(8);
        publisher.publish(event("a"));
        assert_eq!(publisher.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_loses_oldest() {
        let publisher = BroadcastPublisher::new(1);
        let mut rx = publisher.subscribe();
        publisher.publish(event("a"));
        publisher.publish(event("b"));
        assert!(matches!(rx.recv().await, Err(broadcast::error::RecvError::Lagged(1))));
        assert_eq!(rx.recv().await.unwrap().key, "b");
    }

    #[test]
    fn test_event_serializes_kind_lowercase() {
        let json = serde_json::to_value(event("a")).unwrap();
        assert_eq!(json["kind"], "put");
    }
}
