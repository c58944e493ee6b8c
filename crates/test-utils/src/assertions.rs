//! Test assertion helpers.
//!
//! Provides polling-based assertions for async test scenarios.

use std::time::Duration;

use tokio::time::{Instant, sleep};

/// Default polling interval for [`assert_eventually`].
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Polls a condition until it returns true or the timeout expires.
///
/// Background tasks (setup loops, subscription pumps, idle timers) settle
/// at times tests cannot pin down exactly. Under a paused clock each poll
/// step advances virtual time, so generous timeouts cost nothing.
///
/// # Arguments
///
/// * `timeout` - Maximum wait duration
/// * `condition` - Closure returning `true` when the expected state holds
///
/// # Returns
///
/// `true` if the condition became true before timeout, `false` otherwise.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
///
/// use vm_inventory_store::{MemoryStore, StorageClient};
/// use vm_inventory_test_utils::assert_eventually;
///
/// #[tokio::test(start_paused = true)]
/// async fn test_subscription_dropped() {
///     let store = MemoryStore::new();
///     let subscription = store.listen("wf_job_updates").await.unwrap();
///     tokio::spawn(async move {
///         tokio::time::sleep(Duration::from_secs(1)).await;
///         drop(subscription);
///     });
///
///     let closed =
///         assert_eventually(Duration::from_secs(5), || store.subscriber_count("wf_job_updates") == 0)
///             .await;
///     assert!(closed, "subscription should be released");
/// }
/// ```
pub async fn assert_eventually<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let start = Instant::now();

    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        sleep(DEFAULT_POLL_INTERVAL).await;
    }

    // Final check after timeout
    condition()
}
