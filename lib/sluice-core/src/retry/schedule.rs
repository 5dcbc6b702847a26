use std::time::Duration;

const DEFAULT_DELAYS_MS: [u64; 3] = [200, 400, 600];

/// A fixed retry schedule.
///
/// The schedule is an ordered list of delays: after a failed attempt, the next unused delay is waited out before the
/// following attempt, and once every delay has been used the operation is given up on. A schedule with `n` delays
/// therefore allows at most `n + 1` attempts.
///
/// Defaults to three retries after 200ms, 400ms and 600ms.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RetrySchedule {
    delays: Vec<Duration>,
}

impl RetrySchedule {
    /// Creates a schedule from the given delays, in order.
    pub fn fixed<I>(delays: I) -> Self
    where
        I: IntoIterator<Item = Duration>,
    {
        Self {
            delays: delays.into_iter().collect(),
        }
    }

    /// Creates a schedule from the given delays, in milliseconds.
    pub fn from_millis(delays: &[u64]) -> Self {
        Self::fixed(delays.iter().copied().map(Duration::from_millis))
    }

    /// Creates a schedule that never retries.
    pub fn none() -> Self {
        Self { delays: Vec::new() }
    }

    /// Returns the delays, in order.
    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }

    /// Returns the maximum number of attempts, including the initial one.
    pub fn max_attempts(&self) -> u32 {
        u32::try_from(self.delays.len()).unwrap_or(u32::MAX - 1) + 1
    }
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self::from_millis(&DEFAULT_DELAYS_MS)
    }
}
