//! Waiting for workflow jobs to finish.
//!
//! Two paths watch every job: a polling loop reading the job record, and a
//! handler on the shared notification channel. Whichever detects the
//! terminal state first resolves the wait; the [`OnceCallback`] guard turns
//! the other path's completion into a no-op.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use snafu::IntoError;
use tokio::sync::oneshot;
use tracing::Instrument;
use uuid::Uuid;
use vm_inventory_store::StoreConnection;
use vm_inventory_types::{JobNotification, JobRecord, config::JobWaitConfig};

use super::{
    channel::{JobHandler, ListenerId, NotificationChannel},
    source::JobSource,
};
use crate::{
    completion::OnceCallback,
    error::{Error, InternalSnafu, JobFetchSnafu, JobTimeoutSnafu},
};

/// Outcome of a wait, shared with every observer.
///
/// A job that finished as `failed` or `canceled` is an `Ok` outcome.
pub type JobOutcome = Result<JobRecord, Arc<Error>>;

/// Shortest poll interval and time limit a wait accepts.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Per-wait overrides of the configured polling budget.
///
/// Unset fields fall back to the [`JobWaitConfig`]. Values below the
/// accepted minimum are raised rather than rejected: `max_attempts` to 1,
/// `poll_interval` and `timeout` to [`MIN_POLL_INTERVAL`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WaitOptions {
    /// Interval between polls.
    pub poll_interval: Option<Duration>,
    /// Polls made before timing out.
    pub max_attempts: Option<u32>,
    /// Consecutive fetch errors tolerated.
    pub max_consecutive_errors: Option<u32>,
    /// Time limit for the whole wait, fetches included. Without one, only
    /// the attempt budget bounds the wait.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy)]
struct PollBudget {
    interval: Duration,
    max_attempts: u32,
    max_consecutive_errors: u32,
    timeout: Option<Duration>,
}

impl PollBudget {
    fn resolve(config: &JobWaitConfig, options: WaitOptions) -> Self {
        Self {
            interval: options.poll_interval.unwrap_or(config.poll_interval).max(MIN_POLL_INTERVAL),
            max_attempts: options.max_attempts.unwrap_or(config.max_poll_attempts).max(1),
            max_consecutive_errors: options
                .max_consecutive_errors
                .unwrap_or(config.max_consecutive_errors),
            timeout: options.timeout.or(config.timeout).map(|t| t.max(MIN_POLL_INTERVAL)),
        }
    }
}

/// Waits for workflow jobs to reach a terminal state.
#[derive(Clone)]
pub struct JobWaiter {
    source: Arc<dyn JobSource>,
    channel: NotificationChannel,
    config: JobWaitConfig,
}

impl JobWaiter {
    /// Creates a waiter reading jobs from `source` and notifications from
    /// `connection`.
    #[must_use]
    pub fn new(source: Arc<dyn JobSource>, connection: StoreConnection, config: JobWaitConfig) -> Self {
        let channel =
            NotificationChannel::new(connection, config.topic.clone(), config.idle_teardown);
        Self { source, channel, config }
    }

    /// The shared notification channel.
    #[must_use]
    pub fn channel(&self) -> &NotificationChannel {
        &self.channel
    }

    /// Registers a raw notification handler for `job_uuid`.
    ///
    /// Returns `None` when the store does not support notifications.
    pub fn add_listener(&self, job_uuid: Uuid, handler: JobHandler) -> Option<ListenerId> {
        self.channel.add_listener(job_uuid, handler)
    }

    /// Unregisters a handler added with [`add_listener`](Self::add_listener).
    pub fn remove_listener(&self, job_uuid: Uuid, id: ListenerId) -> bool {
        self.channel.remove_listener(job_uuid, id)
    }

    /// Waits for `job_uuid` to finish and invokes `callback` exactly once
    /// with the outcome.
    ///
    /// Returns immediately; the wait runs on spawned tasks. Must be called
    /// from within a tokio runtime.
    pub fn wait_for_job_with_callback(
        &self,
        job_uuid: Uuid,
        options: Option<WaitOptions>,
        callback: impl FnOnce(JobOutcome) + Send + 'static,
    ) {
        let budget = PollBudget::resolve(&self.config, options.unwrap_or_default());
        let guard = Arc::new(OnceCallback::new(callback));

        let listener = self.channel.add_listener(job_uuid, self.notification_handler(&guard));
        if listener.is_none() {
            tracing::debug!(%job_uuid, "Waiting for job by polling only");
        }

        let span = tracing::info_span!("wait_for_job", %job_uuid);
        let source = Arc::clone(&self.source);
        let channel = self.channel.clone();
        tokio::spawn(
            async move {
                poll_until_done(source.as_ref(), job_uuid, &guard, budget).await;
                if let Some(id) = listener {
                    channel.remove_listener(job_uuid, id);
                }
            }
            .instrument(span),
        );
    }

    /// Waits for `job_uuid` to finish.
    ///
    /// # Errors
    ///
    /// Returns [`Error::JobTimeout`] if the job is still running after the
    /// poll budget, or [`Error::JobFetch`] if the job record could not be
    /// read too many times in a row.
    pub async fn wait_for_job(&self, job_uuid: Uuid, options: Option<WaitOptions>) -> JobOutcome {
        let (tx, rx) = oneshot::channel();
        self.wait_for_job_with_callback(job_uuid, options, move |outcome| {
            let _ = tx.send(outcome);
        });
        rx.await.unwrap_or_else(|_| {
            Err(Arc::new(
                InternalSnafu { message: format!("wait for job {job_uuid} abandoned") }.build(),
            ))
        })
    }

    fn notification_handler(&self, guard: &Arc<OnceCallback<JobOutcome>>) -> JobHandler {
        let guard = Arc::clone(guard);
        let source = Arc::clone(&self.source);
        Arc::new(move |notification: &JobNotification| {
            if guard.is_completed() || !notification.execution.is_terminal() {
                return;
            }
            if let Some(job) = notification.job.as_ref().filter(|job| job.is_finished()) {
                if guard.complete(Ok(job.clone())) {
                    tracing::debug!(job_uuid = %job.uuid, "Job finished, notified");
                }
                return;
            }
            // Terminal notification without the record: read it once.
            let guard = Arc::clone(&guard);
            let source = Arc::clone(&source);
            let job_uuid = notification.job_uuid;
            tokio::spawn(async move {
                match source.fetch_job(job_uuid).await {
                    Ok(job) if job.is_finished() => {
                        guard.complete(Ok(job));
                    },
                    Ok(_) => {},
                    Err(error) => {
                        tracing::debug!(%job_uuid, error = %error, "Fetch after notification failed");
                    },
                }
            });
        })
    }
}

async fn poll_until_done(
    source: &dyn JobSource,
    job_uuid: Uuid,
    guard: &OnceCallback<JobOutcome>,
    budget: PollBudget,
) {
    let done = guard.done().clone();
    let attempts = AtomicU32::new(0);
    let polling = poll_loop(source, job_uuid, guard, budget, &attempts);
    let bounded = async {
        match budget.timeout {
            Some(limit) => tokio::time::timeout(limit, polling).await.is_ok(),
            None => {
                polling.await;
                true
            },
        }
    };
    tokio::select! {
        () = done.cancelled() => {},
        finished = bounded => {
            if !finished {
                let attempts = attempts.load(Ordering::Acquire);
                tracing::warn!(%job_uuid, attempts, "Job wait time limit passed");
                guard.complete(Err(Arc::new(JobTimeoutSnafu { job_uuid, attempts }.build())));
            }
        },
    }
}

async fn poll_loop(
    source: &dyn JobSource,
    job_uuid: Uuid,
    guard: &OnceCallback<JobOutcome>,
    budget: PollBudget,
    attempts: &AtomicU32,
) {
    let mut consecutive_errors = 0u32;
    for attempt in 1..=budget.max_attempts {
        attempts.store(attempt, Ordering::Release);
        let fetched = source.fetch_job(job_uuid).await;
        if guard.is_completed() {
            return;
        }
        match fetched {
            Ok(job) if job.is_finished() => {
                tracing::debug!(attempt, execution = ?job.execution, "Job finished, polled");
                guard.complete(Ok(job));
                return;
            },
            Ok(job) => {
                consecutive_errors = 0;
                tracing::trace!(attempt, execution = ?job.execution, "Job still running");
            },
            Err(error) => {
                consecutive_errors += 1;
                tracing::warn!(attempt, consecutive_errors, error = %error, "Job fetch failed");
                if consecutive_errors > budget.max_consecutive_errors {
                    guard.complete(Err(Arc::new(
                        JobFetchSnafu { job_uuid, errors: consecutive_errors }.into_error(error),
                    )));
                    return;
                }
            },
        }
        if attempt < budget.max_attempts {
            tokio::time::sleep(budget.interval).await;
        }
    }
    guard.complete(Err(Arc::new(JobTimeoutSnafu { job_uuid, attempts: budget.max_attempts }.build())));
}

impl std::fmt::Debug for JobWaiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobWaiter")
            .field("channel", &self.channel)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
