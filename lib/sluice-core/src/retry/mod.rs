//! Retrying operations on a fixed schedule.

use std::future::Future;

use tokio::{select, time::sleep};
use tokio_util::sync::CancellationToken;

mod classifier;
pub use self::classifier::RetryClassifier;

mod lifecycle;
pub use self::lifecycle::{DefaultDebugRetryLifecycle, RetryLifecycle};

mod schedule;
pub use self::schedule::RetrySchedule;

/// The result of executing an operation with retries.
#[derive(Debug, PartialEq)]
pub enum RetryResult<T> {
    /// An attempt produced an outcome that is not retryable.
    Finished {
        /// The outcome of the last attempt.
        outcome: T,

        /// The number of attempts made.
        attempts: u32,
    },

    /// Every attempt produced a retryable outcome and the schedule ran out.
    Exhausted {
        /// The outcome of the last attempt.
        outcome: T,

        /// The number of attempts made.
        attempts: u32,
    },

    /// Cancellation was requested before an outcome was reached.
    Cancelled {
        /// The number of attempts started, including one interrupted by cancellation.
        attempts: u32,
    },
}

impl<T> RetryResult<T> {
    /// Returns the number of attempts started.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Finished { attempts, .. } | Self::Exhausted { attempts, .. } | Self::Cancelled { attempts } => {
                *attempts
            }
        }
    }
}

/// Executes operations, retrying them on a fixed schedule.
///
/// Each attempt's outcome is passed to the classifier: outcomes it does not consider retryable end execution
/// immediately, and retryable ones are retried after the next delay in the [`RetrySchedule`] until it runs out.
///
/// Both attempts and the waits between them are raced against a [`CancellationToken`], so cancellation ends execution
/// promptly even in the middle of a request or a backoff.
#[derive(Clone, Debug)]
pub struct RetryExecutor<C, L = DefaultDebugRetryLifecycle> {
    schedule: RetrySchedule,
    classifier: C,
    lifecycle: L,
}

impl<C> RetryExecutor<C> {
    /// Creates a new `RetryExecutor` with the given schedule and classifier.
    pub fn new(schedule: RetrySchedule, classifier: C) -> Self {
        Self {
            schedule,
            classifier,
            lifecycle: DefaultDebugRetryLifecycle,
        }
    }
}

impl<C, L> RetryExecutor<C, L> {
    /// Sets the retry lifecycle.
    pub fn with_retry_lifecycle<L2>(self, lifecycle: L2) -> RetryExecutor<C, L2> {
        RetryExecutor {
            schedule: self.schedule,
            classifier: self.classifier,
            lifecycle,
        }
    }

    /// Returns the retry schedule.
    pub fn schedule(&self) -> &RetrySchedule {
        &self.schedule
    }

    /// Runs `operation` until it produces a non-retryable outcome, the schedule runs out, or `cancel` is triggered.
    ///
    /// The operation is called with the one-based number of the attempt being made.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut operation: F) -> RetryResult<T>
    where
        C: RetryClassifier<T>,
        L: RetryLifecycle<T>,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = T>,
    {
        let mut delays = self.schedule.delays().iter();
        let mut attempts = 0;

        loop {
            if cancel.is_cancelled() {
                return RetryResult::Cancelled { attempts };
            }

            attempts += 1;
            let outcome = select! {
                biased;
                _ = cancel.cancelled() => return RetryResult::Cancelled { attempts },
                outcome = operation(attempts) => outcome,
            };

            if !self.classifier.should_retry(&outcome) {
                self.lifecycle.after_completion(&outcome, attempts);
                return RetryResult::Finished { outcome, attempts };
            }

            let Some(&backoff) = delays.next() else {
                self.lifecycle.after_exhausted(&outcome, attempts);
                return RetryResult::Exhausted { outcome, attempts };
            };

            self.lifecycle.before_retry(&outcome, backoff, attempts);

            select! {
                biased;
                _ = cancel.cancelled() => return RetryResult::Cancelled { attempts },
                _ = sleep(backoff) => {},
            }
        }
    }
}
