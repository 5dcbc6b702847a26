/// Determines whether or not an attempt's outcome should be retried.
///
/// Classification is kept separate from the schedule so that what counts as retryable can be decided by the caller,
/// while how long to wait, and how many times, stays a plain value.
pub trait RetryClassifier<T> {
    /// Returns `true` if the attempt that produced `outcome` should be retried.
    fn should_retry(&self, outcome: &T) -> bool;
}

impl<T, F> RetryClassifier<T> for F
where
    F: Fn(&T) -> bool,
{
    fn should_retry(&self, outcome: &T) -> bool {
        self(outcome)
    }
}
