//! Backoff and retry policies for talking to the coordinator.
//!
//! Two policies exist because the two transports wait differently:
//!
//! - [`ReconnectPolicy`] drives the websocket client. The wait before the next
//!   connection attempt is `min(wait_limit, 2^attempt - elapsed)`, floored at
//!   zero, where `elapsed` is the time the failed attempt itself took.
//! - [`RetryPolicy`] drives the legacy HTTP client. The wait is
//!   `max(0, timeout - elapsed)`, so a request that timed out is retried at once.
//!
//! [`UrlRotation`] implements fail-over between the primary and fallback URL.
//!
//! # Usage
//!
//! ```rust,ignore
//! use conquer_core::retry::{RetryPolicy, with_retry};
//!
//! let policy = RetryPolicy::new(3, Duration::from_secs(10));
//! let body = with_retry(&policy, |attempt| async move {
//!     post_once(attempt).await
//! }).await?;
//! ```

use std::future::Future;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::Result;

/// Reconnect behavior of the websocket client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Consecutive failed connection attempts before giving up.
    pub retry_limit: u32,
    /// Upper bound for a single backoff wait.
    pub wait_limit: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            retry_limit: 6,
            wait_limit: Duration::from_secs(60),
        }
    }
}

impl ReconnectPolicy {
    #[must_use]
    pub fn new(retry_limit: u32, wait_limit: Duration) -> Self {
        Self {
            retry_limit,
            wait_limit,
        }
    }

    /// Wait before connection attempt number `attempt` (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32, elapsed: Duration) -> Duration {
        backoff_delay(attempt, elapsed, self.wait_limit)
    }

    /// Whether a failure on attempt number `attempt` ends the reconnect loop.
    #[must_use]
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.retry_limit
    }
}

/// `min(wait_limit, 2^attempt - elapsed)`, never negative.
#[must_use]
pub fn backoff_delay(attempt: u32, elapsed: Duration, wait_limit: Duration) -> Duration {
    let exponential = 2u64
        .checked_pow(attempt)
        .map_or(Duration::MAX, Duration::from_secs);
    exponential.saturating_sub(elapsed).min(wait_limit)
}

/// Ordered list of endpoints; the head is the one to try next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlRotation {
    urls: Vec<String>,
}

impl UrlRotation {
    #[must_use]
    pub fn new(urls: Vec<String>) -> Self {
        Self { urls }
    }

    /// Endpoint for the next attempt.
    pub fn current(&self) -> Option<&str> {
        self.urls.first().map(String::as_str)
    }

    /// Move the head to the back so the next attempt targets another endpoint.
    pub fn rotate(&mut self) {
        if !self.urls.is_empty() {
            self.urls.rotate_left(1);
        }
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }
}

/// Request retry behavior of the legacy HTTP client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Zero still makes one attempt.
    pub max_attempts: u32,
    /// Per-request timeout, also the pacing interval between attempts.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_attempts: u32, timeout: Duration) -> Self {
        Self {
            max_attempts,
            timeout,
        }
    }

    /// Single attempt, used for fire-and-forget requests such as heartbeats.
    #[must_use]
    pub fn no_retry(timeout: Duration) -> Self {
        Self::new(1, timeout)
    }

    /// Wait after an attempt that took `elapsed`.
    #[must_use]
    pub fn delay_after(&self, elapsed: Duration) -> Duration {
        self.timeout.saturating_sub(elapsed)
    }
}

/// Outcome of a retry operation.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// The result (success or final error).
    pub result: Result<T>,
    /// Number of attempts made.
    pub attempts: u32,
    /// Total time spent (including delays).
    pub elapsed: Duration,
}

/// Execute an async operation with retry. The closure receives the 0-based attempt.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    with_retry_outcome(policy, operation).await.result
}

/// Execute an async operation with retry, returning detailed outcome.
///
/// Errors for which [`Error::is_retryable`](crate::Error::is_retryable) is
/// false end the loop immediately.
pub async fn with_retry_outcome<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let start = Instant::now();
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        let attempt_start = Instant::now();
        match operation(attempt).await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(
                        total_attempts = attempt + 1,
                        "Request succeeded after retries"
                    );
                }
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt + 1,
                    elapsed: start.elapsed(),
                };
            }
            Err(e) => {
                attempt += 1;
                warn!(attempt, error = %e, "could not get successful response from server");

                if !e.is_retryable() || attempt >= max_attempts {
                    return RetryOutcome {
                        result: Err(e),
                        attempts: attempt,
                        elapsed: start.elapsed(),
                    };
                }

                let delay = policy.delay_after(attempt_start.elapsed());
                if !delay.is_zero() {
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying request");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
