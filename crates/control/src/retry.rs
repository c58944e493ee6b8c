//! Retry loops with exponential backoff.
//!
//! Delays come from a `backon` exponential policy built from
//! [`BackoffConfig`]. The loop itself is explicit so that callers observe
//! every failed attempt (for status reporting) and can tell a fatal error
//! apart from an exhausted attempt budget.

use std::{fmt, future::Future};

use backon::{BackoffBuilder, ExponentialBuilder};
use vm_inventory_types::config::BackoffConfig;

/// Why a retry loop stopped without success.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The classifier marked the error as non-retryable.
    Fatal {
        /// Attempts made, including the failing one.
        attempts: u32,
        /// The fatal error.
        error: E,
    },
    /// Every allowed attempt failed with a retryable error.
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Error of the last attempt.
        error: E,
    },
}

impl<E> RetryError<E> {
    /// Attempts made before giving up.
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::Fatal { attempts, .. } | Self::Exhausted { attempts, .. } => *attempts,
        }
    }

    /// The last error.
    pub fn into_error(self) -> E {
        match self {
            Self::Fatal { error, .. } | Self::Exhausted { error, .. } => error,
        }
    }
}

/// Builds the backoff policy for a config.
///
/// `backon` counts retries while `max_attempts` counts attempts, so a cap of
/// `n` attempts allows `n - 1` retries.
pub fn backoff_policy(config: &BackoffConfig) -> ExponentialBuilder {
    let max_retries = config
        .max_attempts
        .map_or(usize::MAX, |attempts| attempts.saturating_sub(1) as usize);
    let builder = ExponentialBuilder::new()
        .with_min_delay(config.initial_delay)
        .with_max_delay(config.max_delay)
        .with_factor(config.multiplier as f32)
        .with_max_times(max_retries);
    if config.jitter { builder.with_jitter() } else { builder }
}

/// Runs `operation` until it succeeds, fails with an error `is_transient`
/// rejects, or runs out of attempts.
///
/// `on_failure` is called after every failed attempt with the error and the
/// attempt number, before the loop decides whether to retry.
pub async fn retry_with_backoff<T, E, F, Fut, C, O>(
    config: &BackoffConfig,
    phase: &'static str,
    is_transient: C,
    mut on_failure: O,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    E: fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> bool,
    O: FnMut(&E, u32),
{
    let mut delays = backoff_policy(config).build();
    let mut attempt: u32 = 0;

    loop {
        attempt = attempt.saturating_add(1);
        let error = match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(phase, attempt, "Succeeded after retry");
                }
                return Ok(value);
            },
            Err(error) => error,
        };

        on_failure(&error, attempt);

        if !is_transient(&error) {
            tracing::error!(phase, attempt, error = %error, "Non-retryable error");
            return Err(RetryError::Fatal { attempts: attempt, error });
        }

        let Some(delay) = delays.next() else {
            tracing::error!(phase, attempts = attempt, error = %error, "Retry attempts exhausted");
            return Err(RetryError::Exhausted { attempts: attempt, error });
        };

        tracing::warn!(
            phase,
            attempt,
            backoff_ms = delay.as_millis() as u64,
            error = %error,
            "Attempt failed, retrying after backoff"
        );
        tokio::time::sleep(delay).await;
    }
}
