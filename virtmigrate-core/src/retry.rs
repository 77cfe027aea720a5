//! Bounded retry with multiplicative backoff
//!
//! Only operations that are expected to settle after a short delay use
//! this (cluster objects that take a moment to become visible). Polling
//! loops with deadlines live with their callers.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Multiplier applied to the delay after every failed attempt
    pub factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            factor: 2,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, factor: u32) -> Self {
        Self {
            max_attempts,
            base_delay,
            factor,
        }
    }

    /// Delays slept between attempts, in order.
    ///
    /// Always `max_attempts - 1` entries: no sleep follows the last attempt.
    pub fn delays(&self) -> Vec<Duration> {
        let mut delays = Vec::new();
        let mut delay = self.base_delay;
        for _ in 1..self.max_attempts {
            delays.push(delay);
            delay = delay.saturating_mul(self.factor);
        }
        delays
    }
}

/// What a retried operation produced
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// Value returned by the last attempt
    pub value: T,
    /// Attempts actually made
    pub attempts: u32,
    /// Whether the success predicate accepted the last value
    pub succeeded: bool,
}

/// Run `operation` until `is_success` accepts its output or the attempt
/// budget is spent.
pub async fn retry_until<T, F, Fut, P>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
    is_success: P,
) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = T>,
    P: Fn(&T) -> bool, {
    let mut delays = policy.delays().into_iter();
    let mut attempts = 0;

    loop {
        attempts += 1;
        let value = operation().await;

        if is_success(&value) {
            return RetryOutcome {
                value,
                attempts,
                succeeded: true,
            };
        }

        match delays.next() {
            Some(delay) => {
                debug!(
                    operation = operation_name,
                    attempt = attempts,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Attempt did not succeed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            None => {
                return RetryOutcome {
                    value,
                    attempts,
                    succeeded: false,
                };
            }
        }
    }
}
