use std::time::Duration;

use tracing::debug;

/// Hooks called at points of interest while executing an operation with retries.
///
/// Used to add contextual logging around retries without coupling the executor to what is being retried.
pub trait RetryLifecycle<T> {
    /// Called after a failed attempt, before waiting `backoff` and making the next attempt.
    fn before_retry(&self, outcome: &T, backoff: Duration, attempts: u32);

    /// Called when an attempt's outcome is not retryable.
    fn after_completion(&self, _outcome: &T, _attempts: u32) {}

    /// Called when the final attempt failed and the schedule has no delays left.
    fn after_exhausted(&self, outcome: &T, attempts: u32);
}

/// A retry lifecycle that emits minimal debug logs.
#[derive(Clone, Debug)]
pub struct DefaultDebugRetryLifecycle;

impl<T> RetryLifecycle<T> for DefaultDebugRetryLifecycle {
    fn before_retry(&self, _: &T, backoff: Duration, attempts: u32) {
        debug!(attempts, "Retrying after {:?}.", backoff);
    }

    fn after_exhausted(&self, _: &T, attempts: u32) {
        debug!(attempts, "Retries exhausted.");
    }
}
