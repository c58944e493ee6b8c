//! Shared job notification subscription.
//!
//! Every job waiter shares one subscription to the job notification topic.
//! Handlers register per job UUID; notifications are demultiplexed to the
//! handlers of the job they name.
//!
//! ```text
//!                  first listener                 last listener removed
//! Uninitialized ────────────────► Connecting ──► Listening ─────────────► Idle(timer)
//!       ▲                             │  ▲            ▲                       │
//!       │                   rejected  │  │ listener   └───── new listener ────┤
//!       │                  as unsup.  │  │ added                              │ timer fires
//!       │                             ▼  │                                    ▼
//!       │                       Unsupported  Closed ◄─────────────────────────┘
//!       └───── (Closed behaves like Uninitialized: the next listener reconnects)
//! ```
//!
//! The listener count and the idle timer's arm/disarm steps happen under
//! one lock with no suspension point in between. Timer and pump tasks carry
//! the generation or epoch they were spawned for and do nothing once it is
//! stale.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use vm_inventory_store::{StoreConnection, Subscription};
use vm_inventory_types::{JobNotification, StoreErrorKind};

/// Callback invoked for each notification about one job.
pub type JobHandler = Arc<dyn Fn(&JobNotification) + Send + Sync>;

/// Identifies a registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Lifecycle phase of the shared subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPhase {
    /// Never connected.
    Uninitialized,
    /// A `listen` call is in flight.
    Connecting,
    /// Subscribed with at least one listener.
    Listening,
    /// Subscribed with no listener; closes when the idle timer fires.
    Idle,
    /// Subscription ended; the next listener reconnects.
    Closed,
    /// The store does not support pub/sub. Permanent.
    Unsupported,
}

#[derive(Default)]
struct ChannelState {
    phase: Option<ChannelPhase>,
    handlers: HashMap<Uuid, Vec<(ListenerId, JobHandler)>>,
    listeners: usize,
    next_id: u64,
    /// Bumped on every arm or disarm of the idle timer.
    generation: u64,
    /// Bumped for every subscription attempt.
    epoch: u64,
    /// Stops the pump of the current subscription.
    pump: Option<CancellationToken>,
}

impl ChannelState {
    fn phase(&self) -> ChannelPhase {
        self.phase.unwrap_or(ChannelPhase::Uninitialized)
    }
}

struct ChannelInner {
    connection: StoreConnection,
    topic: String,
    idle_teardown: Duration,
    state: Mutex<ChannelState>,
}

/// Reference-counted subscription to the job notification topic.
///
/// Cloning is cheap; clones share the subscription.
#[derive(Clone)]
pub struct NotificationChannel {
    inner: Arc<ChannelInner>,
}

impl NotificationChannel {
    /// Creates an unconnected channel.
    #[must_use]
    pub fn new(connection: StoreConnection, topic: impl Into<String>, idle_teardown: Duration) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                connection,
                topic: topic.into(),
                idle_teardown,
                state: Mutex::new(ChannelState::default()),
            }),
        }
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> ChannelPhase {
        self.inner.state.lock().phase()
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.state.lock().listeners
    }

    /// Registers `handler` for notifications about `job_uuid`, connecting
    /// the subscription if needed.
    ///
    /// Returns `None` when notifications are unsupported; callers fall back
    /// to polling. Must be called from within a tokio runtime.
    pub fn add_listener(&self, job_uuid: Uuid, handler: JobHandler) -> Option<ListenerId> {
        let mut state = self.inner.state.lock();
        if state.phase() == ChannelPhase::Unsupported {
            return None;
        }

        state.next_id += 1;
        let id = ListenerId(state.next_id);
        state.handlers.entry(job_uuid).or_default().push((id, handler));
        state.listeners += 1;

        match state.phase() {
            ChannelPhase::Uninitialized | ChannelPhase::Closed => {
                state.phase = Some(ChannelPhase::Connecting);
                state.epoch += 1;
                let epoch = state.epoch;
                tracing::debug!(topic = %self.inner.topic, epoch, "Connecting job notifications");
                tokio::spawn(Arc::clone(&self.inner).connect(epoch));
            },
            ChannelPhase::Idle => {
                // Disarms the pending teardown.
                state.generation += 1;
                state.phase = Some(ChannelPhase::Listening);
                tracing::debug!(topic = %self.inner.topic, "Reusing idle job subscription");
            },
            ChannelPhase::Connecting | ChannelPhase::Listening | ChannelPhase::Unsupported => {},
        }
        Some(id)
    }

    /// Unregisters a handler. Removing the last handler arms the idle timer.
    ///
    /// Returns false if the handler was not registered.
    pub fn remove_listener(&self, job_uuid: Uuid, id: ListenerId) -> bool {
        let mut state = self.inner.state.lock();
        let Some(handlers) = state.handlers.get_mut(&job_uuid) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        if handlers.len() == before {
            return false;
        }
        if handlers.is_empty() {
            state.handlers.remove(&job_uuid);
        }
        state.listeners -= 1;

        if state.listeners == 0 && state.phase() == ChannelPhase::Listening {
            self.inner.arm_idle_timer(&mut state);
        }
        true
    }
}

impl ChannelInner {
    fn arm_idle_timer(self: &Arc<Self>, state: &mut ChannelState) {
        state.generation += 1;
        state.phase = Some(ChannelPhase::Idle);
        let generation = state.generation;
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(inner.idle_teardown).await;
            inner.teardown_if_idle(generation);
        });
    }

    fn teardown_if_idle(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.phase() != ChannelPhase::Idle || state.generation != generation {
            return;
        }
        state.phase = Some(ChannelPhase::Closed);
        state.epoch += 1;
        if let Some(pump) = state.pump.take() {
            pump.cancel();
        }
        tracing::debug!(topic = %self.topic, "Closed idle job subscription");
    }

    async fn connect(self: Arc<Self>, epoch: u64) {
        let result = self.connection.listen(&self.topic).await;

        let mut state = self.state.lock();
        if state.epoch != epoch || state.phase() != ChannelPhase::Connecting {
            return;
        }
        match result {
            Ok(subscription) => {
                let token = CancellationToken::new();
                state.pump = Some(token.clone());
                if state.listeners == 0 {
                    // Everyone left while connecting.
                    state.phase = Some(ChannelPhase::Listening);
                    self.arm_idle_timer(&mut state);
                } else {
                    state.phase = Some(ChannelPhase::Listening);
                }
                tracing::debug!(topic = %self.topic, epoch, "Job notifications connected");
                tokio::spawn(Arc::clone(&self).pump(subscription, token, epoch));
            },
            Err(error) if error.kind() == StoreErrorKind::UnsupportedRpc => {
                state.phase = Some(ChannelPhase::Unsupported);
                tracing::info!(topic = %self.topic, "Job notifications unsupported, polling only");
            },
            Err(error) => {
                state.phase = Some(ChannelPhase::Closed);
                tracing::warn!(topic = %self.topic, error = %error, "Job notification subscribe failed");
            },
        }
    }

    async fn pump(self: Arc<Self>, mut subscription: Subscription, token: CancellationToken, epoch: u64) {
        loop {
            let message = tokio::select! {
                () = token.cancelled() => {
                    subscription.close();
                    return;
                }
                message = subscription.recv() => message,
            };
            match message {
                Some(Ok(payload)) => match serde_json::from_value::<JobNotification>(payload) {
                    Ok(notification) => self.dispatch(&notification),
                    Err(e) => tracing::debug!(error = %e, "Ignoring malformed job notification"),
                },
                Some(Err(error)) => {
                    tracing::warn!(topic = %self.topic, error = %error, "Job subscription failed");
                    break;
                },
                None => {
                    tracing::debug!(topic = %self.topic, "Job subscription ended");
                    break;
                },
            }
        }

        let mut state = self.state.lock();
        if state.epoch == epoch {
            state.phase = Some(ChannelPhase::Closed);
            state.pump = None;
        }
    }

    fn dispatch(&self, notification: &JobNotification) {
        let handlers: Vec<JobHandler> = self
            .state
            .lock()
            .handlers
            .get(&notification.job_uuid)
            .map(|hs| hs.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();
        // Handlers run outside the lock so they may add or remove listeners.
        for handler in handlers {
            handler(notification);
        }
    }
}

impl fmt::Debug for NotificationChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("NotificationChannel")
            .field("topic", &self.inner.topic)
            .field("phase", &state.phase())
            .field("listeners", &state.listeners)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::json;
    use vm_inventory_store::{MemoryStore, StoreMethod};
    use vm_inventory_test_utils::assert_eventually;
    use vm_inventory_types::StoreError;

    use super::*;

    const TOPIC: &str = "wf_job_updates";

    fn channel(store: &MemoryStore) -> NotificationChannel {
        NotificationChannel::new(
            StoreConnection::new(Arc::new(store.clone())),
            TOPIC,
            Duration::from_secs(30),
        )
    }

    fn counting_handler() -> (JobHandler, Arc<AtomicU32>) {
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        (Arc::new(move |_: &JobNotification| {
            c.fetch_add(1, Ordering::SeqCst);
        }), count)
    }

    fn notification(job: Uuid) -> serde_json::Value {
        json!({"job_uuid": job, "execution": "running"})
    }

    async fn listening(channel: &NotificationChannel) {
        assert!(assert_eventually(Duration::from_secs(1), || channel.phase() == ChannelPhase::Listening).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_listener_connects_once() {
        let store = MemoryStore::new();
        let channel = channel(&store);
        assert_eq!(channel.phase(), ChannelPhase::Uninitialized);

        let (h1, _) = counting_handler();
        let (h2, _) = counting_handler();
        channel.add_listener(Uuid::new_v4(), h1).unwrap();
        channel.add_listener(Uuid::new_v4(), h2).unwrap();
        listening(&channel).await;

        assert_eq!(store.call_count(StoreMethod::Listen), 1);
        assert_eq!(channel.listener_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_notifications_routed_by_job() {
        let store = MemoryStore::new();
        let channel = channel(&store);
        let (job_a, job_b) = (Uuid::new_v4(), Uuid::new_v4());
        let (ha, count_a) = counting_handler();
        let (hb, count_b) = counting_handler();
        channel.add_listener(job_a, ha).unwrap();
        channel.add_listener(job_b, hb).unwrap();
        listening(&channel).await;

        store.notify(TOPIC, notification(job_a));
        store.notify(TOPIC, notification(job_a));
        store.notify(TOPIC, json!({"garbage": true}));
        assert!(assert_eventually(Duration::from_secs(1), || count_a.load(Ordering::SeqCst) == 2).await);
        assert_eq!(count_b.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_teardown_after_last_listener() {
        let store = MemoryStore::new();
        let channel = channel(&store);
        let job = Uuid::new_v4();
        let (h, _) = counting_handler();
        let id = channel.add_listener(job, h).unwrap();
        listening(&channel).await;

        assert!(channel.remove_listener(job, id));
        assert!(!channel.remove_listener(job, id));
        assert_eq!(channel.phase(), ChannelPhase::Idle);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(channel.phase(), ChannelPhase::Closed);
        assert!(assert_eventually(Duration::from_secs(1), || store.subscriber_count(TOPIC) == 0).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_listener_while_idle_reuses_subscription() {
        let store = MemoryStore::new();
        let channel = channel(&store);
        let job = Uuid::new_v4();
        let (h, _) = counting_handler();
        let id = channel.add_listener(job, h).unwrap();
        listening(&channel).await;
        channel.remove_listener(job, id);

        tokio::time::sleep(Duration::from_secs(10)).await;
        let (h2, count) = counting_handler();
        channel.add_listener(job, h2).unwrap();
        assert_eq!(channel.phase(), ChannelPhase::Listening);

        // The stale timer fires and does nothing.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(channel.phase(), ChannelPhase::Listening);
        assert_eq!(store.call_count(StoreMethod::Listen), 1);

        store.notify(TOPIC, notification(job));
        assert!(assert_eventually(Duration::from_secs(1), || count.load(Ordering::SeqCst) == 1).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_teardown() {
        let store = MemoryStore::new();
        let channel = channel(&store);
        let job = Uuid::new_v4();
        let (h, _) = counting_handler();
        let id = channel.add_listener(job, h.clone()).unwrap();
        listening(&channel).await;
        channel.remove_listener(job, id);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(channel.phase(), ChannelPhase::Closed);

        channel.add_listener(job, h).unwrap();
        listening(&channel).await;
        assert_eq!(store.call_count(StoreMethod::Listen), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_is_permanent() {
        let store = MemoryStore::new();
        store.set_listen_supported(false);
        let channel = channel(&store);
        let (h, _) = counting_handler();
        assert!(channel.add_listener(Uuid::new_v4(), h.clone()).is_some());
        assert!(assert_eventually(Duration::from_secs(1), || channel.phase() == ChannelPhase::Unsupported)
            .await);

        store.set_listen_supported(true);
        assert!(channel.add_listener(Uuid::new_v4(), h).is_none());
        assert_eq!(store.call_count(StoreMethod::Listen), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_failure_closes_channel() {
        let store = MemoryStore::new();
        let channel = channel(&store);
        let (h, _) = counting_handler();
        channel.add_listener(Uuid::new_v4(), h).unwrap();
        listening(&channel).await;

        store.end_subscriptions(TOPIC, Some(StoreError::connection("reset")));
        assert!(assert_eventually(Duration::from_secs(1), || channel.phase() == ChannelPhase::Closed).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_connect_failure_retried_by_next_listener() {
        let store = MemoryStore::new();
        store.inject_error(StoreMethod::Listen, StoreError::connection("reset"));
        let channel = channel(&store);
        let (h, _) = counting_handler();
        channel.add_listener(Uuid::new_v4(), h.clone()).unwrap();
        assert!(assert_eventually(Duration::from_secs(1), || channel.phase() == ChannelPhase::Closed).await);

        channel.add_listener(Uuid::new_v4(), h).unwrap();
        listening(&channel).await;
    }
}
