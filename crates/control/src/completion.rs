//! Single-outcome completion guards.
//!
//! Both guards resolve at most once; later completions are ignored and
//! reported as such to the caller.

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Outcome slot awaited by any number of tasks.
#[derive(Debug)]
pub struct CompletionSignal<T> {
    sender: watch::Sender<Option<T>>,
}

impl<T: Clone> CompletionSignal<T> {
    /// Creates an unresolved signal.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = watch::channel(None);
        Self { sender }
    }

    /// Resolves the signal. Returns false if it was already resolved.
    pub fn complete(&self, value: T) -> bool {
        let mut value = Some(value);
        self.sender.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = value.take();
            true
        })
    }

    /// Returns the outcome if resolved.
    #[must_use]
    pub fn get(&self) -> Option<T> {
        self.sender.borrow().clone()
    }

    /// Returns true once resolved.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.sender.borrow().is_some()
    }

    /// Waits for the outcome.
    pub async fn wait(&self) -> T {
        let mut receiver = self.sender.subscribe();
        loop {
            if let Some(value) = receiver.borrow_and_update().clone() {
                return value;
            }
            if receiver.changed().await.is_err() {
                // The sender lives in `self`, so the channel cannot close
                // while this future is alive.
                std::future::pending::<()>().await;
            }
        }
    }
}

impl<T: Clone> Default for CompletionSignal<T> {
    fn default() -> Self {
        Self::new()
    }
}

type Callback<T> = Box<dyn FnOnce(T) + Send>;

/// Callback invoked at most once, by whichever path completes first.
pub struct OnceCallback<T> {
    callback: Mutex<Option<Callback<T>>>,
    done: CancellationToken,
}

impl<T> OnceCallback<T> {
    /// Wraps `callback`.
    pub fn new(callback: impl FnOnce(T) + Send + 'static) -> Self {
        Self { callback: Mutex::new(Some(Box::new(callback))), done: CancellationToken::new() }
    }

    /// Invokes the callback with `value` unless it already ran.
    ///
    /// Returns true if this call invoked it.
    pub fn complete(&self, value: T) -> bool {
        let Some(callback) = self.callback.lock().take() else {
            return false;
        };
        self.done.cancel();
        callback(value);
        true
    }

    /// Returns true once the callback ran (or is running).
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Token cancelled when the callback is claimed.
    #[must_use]
    pub fn done(&self) -> &CancellationToken {
        &self.done
    }
}

impl<T> std::fmt::Debug for OnceCallback<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnceCallback").field("completed", &self.is_completed()).finish()
    }
}
