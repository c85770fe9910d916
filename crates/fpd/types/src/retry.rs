//! Fixed-attempt, fixed-delay retry for chain I/O
//!
//! Every retried call also watches the shared shutdown token, so a stuck RPC
//! never holds up teardown.

use backon::{ConstantBuilder, Retryable};
use serde::{Deserialize, Serialize};
use std::{fmt::Display, future::Future, time::Duration};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Default number of attempts for chain queries
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 5;

/// Default delay between attempts
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Retry policy: `max_attempts` tries, `delay` apart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay between two attempts
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: DEFAULT_RETRY_ATTEMPTS, delay: DEFAULT_RETRY_DELAY }
    }
}

impl RetryPolicy {
    /// Create a policy
    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        Self { max_attempts, delay }
    }

    /// Backoff schedule implementing this policy
    pub fn backoff(&self) -> ConstantBuilder {
        ConstantBuilder::default()
            .with_delay(self.delay)
            .with_max_times(self.max_attempts.saturating_sub(1) as usize)
    }
}

/// Failure of a retried operation
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Shutdown was requested before the operation succeeded
    #[error("operation cancelled")]
    Cancelled,

    /// The last attempt failed, or the error was not retryable
    #[error("{0}")]
    Failed(E),
}

/// Retry `op` under `policy` until it succeeds, attempts run out, or
/// `shutdown` fires.
pub async fn retry_with_shutdown<T, E, F, Fut>(
    policy: &RetryPolicy,
    shutdown: &CancellationToken,
    operation: &'static str,
    op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    retry_when(policy, shutdown, operation, op, |_| true).await
}

/// Like [`retry_with_shutdown`], but only errors accepted by `is_retryable`
/// are retried; any other error is returned immediately.
pub async fn retry_when<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    shutdown: &CancellationToken,
    operation: &'static str,
    op: F,
    is_retryable: P,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    P: FnMut(&E) -> bool,
{
    let attempts = policy.max_attempts;
    let retried = op.retry(policy.backoff()).when(is_retryable).notify(|err: &E, delay: Duration| {
        warn!(
            target: "fpd::retry",
            operation,
            max_attempts = attempts,
            retry_in_ms = delay.as_millis() as u64,
            error = %err,
            "Attempt failed, retrying"
        );
    });

    tokio::select! {
        biased;
        _ = shutdown.cancelled() => Err(RetryError::Cancelled),
        res = retried => res.map_err(RetryError::Failed),
    }
}

/// Sleep for `duration` unless `shutdown` fires first.
///
/// Returns `false` when interrupted by shutdown.
pub async fn sleep_or_shutdown(duration: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
