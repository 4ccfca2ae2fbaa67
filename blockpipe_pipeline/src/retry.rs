//! Bounded retry of block writes.

use std::time::Duration;

/// Number of times a failed block write is retried before the pipeline stops.
pub const DEFAULT_MAX_RETRIES: usize = 3;

/// Delay applied before retrying a failed block write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// Retry immediately.
    #[default]
    None,

    /// Wait the same duration before every retry.
    Fixed(Duration),

    /// Double the delay on every retry, starting at `initial` and never exceeding `max`.
    Exponential { initial: Duration, max: Duration },
}

impl BackoffStrategy {
    /// The delay to wait before the `retry`-th retry (1-based).
    pub fn delay_for_retry(&self, retry: usize) -> Duration {
        match *self {
            Self::None => Duration::ZERO,
            Self::Fixed(delay) => delay,
            Self::Exponential { initial, max } => {
                let exp = u32::try_from(retry.saturating_sub(1))
                    .unwrap_or(u32::MAX)
                    .min(31);
                initial
                    .checked_mul(1_u32 << exp)
                    .map_or(max, |delay| delay.min(max))
            }
        }
    }
}

/// How often, and how patiently, a block write is retried.
///
/// A block gets one initial attempt plus up to `max_retries` retries. The backoff strategy only
/// affects the pacing of those attempts, never their number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub backoff: BackoffStrategy,
}

impl RetryPolicy {
    pub fn new(max_retries: usize, backoff: BackoffStrategy) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// Total number of write attempts a block may get.
    pub fn max_attempts(&self) -> usize {
        self.max_retries.saturating_add(1)
    }

    /// Whether another attempt may follow `attempts_made` failed attempts.
    pub fn should_retry(&self, attempts_made: usize) -> bool {
        attempts_made < self.max_attempts()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, BackoffStrategy::None)
    }
}
