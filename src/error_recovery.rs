//! Bounded retry for unreliable hardware links.
//!
//! The shutter-release accessory answers each command with an echo that may be
//! missing or garbled, so commands are retried with a fixed budget and a fixed
//! wait between attempts. [`retry_with_policy`] runs an async operation under
//! a [`RetryPolicy`] and reports how many attempts were made, so callers can
//! surface the count.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// The maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// The delay between attempts. Not applied after the last one.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff_delay: Duration::from_millis(250),
        }
    }
}

/// Successful result of a retried operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempted<T> {
    /// Value returned by the successful attempt.
    pub value: T,
    /// 1-based attempt on which the operation succeeded.
    pub attempts: u32,
}

/// The budget ran out; carries the error of the final attempt.
#[derive(Debug)]
pub struct Exhausted<E> {
    /// Error of the final attempt.
    pub last_error: E,
    /// Attempts made, equal to the budget.
    pub attempts: u32,
}

/// Run `operation` until it succeeds or the policy's budget is spent.
///
/// `operation` receives the 1-based attempt number. A zero budget is treated
/// as a single attempt.
pub async fn retry_with_policy<T, E, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut operation: F,
) -> Result<Attempted<T>, Exhausted<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => {
                debug!("{} succeeded on attempt {}", label, attempt);
                return Ok(Attempted {
                    value,
                    attempts: attempt,
                });
            }
            Err(err) if attempt >= max_attempts => {
                warn!("{} failed after {} attempts: {}", label, attempt, err);
                return Err(Exhausted {
                    last_error: err,
                    attempts: attempt,
                });
            }
            Err(err) => {
                debug!(
                    "{} attempt {}/{} failed: {}",
                    label, attempt, max_attempts, err
                );
                sleep(policy.backoff_delay).await;
                attempt += 1;
            }
        }
    }
}
