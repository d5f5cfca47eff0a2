//! Bounded retry with a success predicate.
//!
//! [`RetryPolicy`] is a stateless call wrapper: it invokes an async
//! operation, waits a backoff proportional to the attempt number after an
//! error or a rejected result, and gives up after `max_attempts`, handing
//! back the last failure.
//!
//! # Example
//!
//! ```rust,ignore
//! use drover::retry::RetryPolicy;
//!
//! let policy = RetryPolicy::new(3, 500);
//! let balance = policy
//!     .run(|_attempt| fetch_balance(), |balance| *balance > 0)
//!     .await?;
//! ```

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

// ============================================================================
// Backoff Constants and Calculation
// ============================================================================

/// Default number of attempts (the first call included).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Base backoff delay in milliseconds for retry attempts.
pub const RETRY_BACKOFF_BASE_MS: u64 = 2000;

/// Maximum backoff delay in milliseconds.
pub const MAX_BACKOFF_MS: u64 = 30_000;

/// Calculate the linear backoff delay after a failed attempt.
///
/// # Arguments
///
/// * `base_ms` - Delay after the first failed attempt.
/// * `attempt` - The attempt that just failed (1-indexed).
/// * `max_ms` - Upper bound on the returned delay.
///
/// # Example
///
/// ```
/// use drover::retry::calculate_backoff;
/// use std::time::Duration;
///
/// assert_eq!(calculate_backoff(2000, 1, 30_000), Duration::from_millis(2000));
/// assert_eq!(calculate_backoff(2000, 3, 30_000), Duration::from_millis(6000));
/// assert_eq!(calculate_backoff(2000, 50, 30_000), Duration::from_millis(30_000));
/// ```
#[must_use]
pub fn calculate_backoff(base_ms: u64, attempt: u32, max_ms: u64) -> Duration {
    let delay = base_ms.saturating_mul(u64::from(attempt.max(1)));
    Duration::from_millis(delay.min(max_ms))
}

// ============================================================================
// Retry Policy
// ============================================================================

/// Why a retried call ultimately failed.
#[derive(Debug, Error)]
pub enum RetryError<T, E> {
    /// The last attempt returned an error.
    #[error("failed after {attempts} attempt(s): {error}")]
    Failed { attempts: u32, error: E },
    /// The last attempt returned a value the predicate rejected.
    #[error("result rejected after {attempts} attempt(s)")]
    Rejected { attempts: u32, value: T },
}

impl<T, E> RetryError<T, E> {
    /// Number of attempts made before giving up.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Failed { attempts, .. } | Self::Rejected { attempts, .. } => *attempts,
        }
    }
}

/// Bounded retry configuration. Stateless and reusable across calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, the first call included. Values below 1 act as 1.
    pub max_attempts: u32,
    /// Backoff after the first failure; attempt `n` waits `n * base`.
    pub backoff_base_ms: u64,
    /// Cap applied to every backoff.
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base_ms: RETRY_BACKOFF_BASE_MS,
            max_backoff_ms: MAX_BACKOFF_MS,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the default backoff cap.
    #[must_use]
    pub fn new(max_attempts: u32, backoff_base_ms: u64) -> Self {
        Self {
            max_attempts,
            backoff_base_ms,
            ..Self::default()
        }
    }

    /// Delay to wait after `attempt` failed.
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        calculate_backoff(self.backoff_base_ms, attempt, self.max_backoff_ms)
    }

    /// Run `operation` until `is_success` accepts its value or attempts run out.
    ///
    /// The operation receives the 1-indexed attempt number.
    ///
    /// # Errors
    ///
    /// Returns the last failure (error or rejected value) once
    /// `max_attempts` calls have been made.
    pub async fn run<T, E, F, Fut, P>(
        &self,
        operation: F,
        is_success: P,
    ) -> Result<T, RetryError<T, E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnMut(&T) -> bool,
    {
        self.run_while(operation, is_success, |_| true).await
    }

    /// Like [`RetryPolicy::run`], but an error rejected by `is_retryable` is
    /// returned at once without further attempts.
    ///
    /// # Errors
    ///
    /// Returns the last failure, or the first non-retryable error.
    pub async fn run_while<T, E, F, Fut, P, R>(
        &self,
        mut operation: F,
        mut is_success: P,
        mut is_retryable: R,
    ) -> Result<T, RetryError<T, E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnMut(&T) -> bool,
        R: FnMut(&E) -> bool,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let failure = match operation(attempt).await {
                Ok(value) if is_success(&value) => return Ok(value),
                Ok(value) => RetryError::Rejected {
                    attempts: attempt,
                    value,
                },
                Err(error) => {
                    if !is_retryable(&error) {
                        return Err(RetryError::Failed {
                            attempts: attempt,
                            error,
                        });
                    }
                    RetryError::Failed {
                        attempts: attempt,
                        error,
                    }
                }
            };

            if attempt >= max_attempts {
                return Err(failure);
            }

            let delay = self.backoff_for(attempt);
            debug!(
                "Attempt {}/{} failed, retrying in {:?}",
                attempt, max_attempts, delay
            );
            tokio::time::sleep(delay).await;
        }
    }
}
