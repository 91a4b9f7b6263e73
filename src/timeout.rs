//! Deadline enforcement for async operations.
//!
//! Wraps an operation in `tokio::time::timeout`; when the deadline fires the
//! inner future is dropped, so cancellation-unsafe work may leave partial
//! state behind. Elapsed time can exceed the configured limit slightly due
//! to timer resolution.

use crate::error::ReliabilityError;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Ceiling that guards against accidental `u64::MAX`-style timeouts.
/// Override with [`TimeoutPolicy::new_with_max`] for longer horizons.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Rejected timeout configurations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TimeoutConfigError {
    #[error("timeout duration must be > 0")]
    ZeroDuration,
    #[error("timeout {requested:?} exceeds maximum {limit:?}")]
    ExceedsMaximum { requested: Duration, limit: Duration },
}

/// Policy bounding the duration of an operation.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutPolicy {
    duration: Duration,
}

impl TimeoutPolicy {
    pub fn new(duration: Duration) -> Result<Self, TimeoutConfigError> {
        Self::new_with_max(duration, MAX_TIMEOUT)
    }

    pub fn new_with_max(duration: Duration, max: Duration) -> Result<Self, TimeoutConfigError> {
        if duration.is_zero() {
            return Err(TimeoutConfigError::ZeroDuration);
        }
        if duration > max {
            return Err(TimeoutConfigError::ExceedsMaximum { requested: duration, limit: max });
        }
        Ok(Self { duration })
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Race `operation` against the deadline.
    pub async fn execute<T, E, Fut, Op>(&self, mut operation: Op) -> Result<T, ReliabilityError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ReliabilityError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let started = Instant::now();
        match tokio::time::timeout(self.duration, operation()).await {
            Ok(result) => result,
            Err(_) => Err(ReliabilityError::Timeout {
                elapsed: started.elapsed(),
                limit: self.duration,
            }),
        }
    }
}
