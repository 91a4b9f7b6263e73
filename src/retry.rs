//! Bounded retry with backoff, jitter, and a caller-supplied predicate.
//!
//! Only `Inner` errors are candidates for retry; gate rejections (open
//! circuit, rate limit, timeout, capacity) pass straight through. Which
//! inner errors retry is entirely the predicate's call — there is no
//! message inspection here.

use crate::backoff::Backoff;
use crate::error::{ReliabilityError, MAX_RETRY_FAILURES};
use crate::jitter::Jitter;
use crate::sleeper::{Sleeper, TokioSleeper};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Retry tuning as carried by the manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub enabled: bool,
    /// Total attempts, the first included.
    pub max_retries: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// The backoff schedule this configuration describes.
    pub fn backoff(&self) -> Backoff {
        Backoff::exponential_with_factor(self.initial_delay, self.factor).with_max(self.max_delay)
    }
}

/// Rejected retry configurations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RetryBuildError {
    #[error("max_attempts must be > 0")]
    ZeroAttempts,
}

type RetryPredicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;
type RetryObserver<E> = Arc<dyn Fn(usize, Duration, &E) + Send + Sync>;

/// Executes an operation up to `max_attempts` times.
#[derive(Clone)]
pub struct RetryPolicy<E> {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    should_retry: RetryPredicate<E>,
    sleeper: Arc<dyn Sleeper>,
    on_retry: Option<RetryObserver<E>>,
}

impl<E> std::fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .finish()
    }
}

impl<E> RetryPolicy<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn builder() -> RetryPolicyBuilder<E> {
        RetryPolicyBuilder::new()
    }

    /// Build a policy straight from a [`RetryConfig`], keeping the default
    /// retry-everything predicate.
    pub fn from_config(config: &RetryConfig) -> Self {
        RetryPolicyBuilder::new()
            .max_attempts(config.max_retries.max(1))
            .backoff(config.backoff())
            .build()
            .unwrap_or_else(|_| unreachable!("attempt count is clamped above zero"))
    }

    pub async fn execute<T, Fut, Op>(&self, mut operation: Op) -> Result<T, ReliabilityError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, ReliabilityError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let mut failures = Vec::new();

        for attempt in 1..=self.max_attempts {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(ReliabilityError::Inner(e)) => {
                    if !(self.should_retry)(&e) {
                        return Err(ReliabilityError::Inner(e));
                    }

                    failures.push(e);
                    if failures.len() > MAX_RETRY_FAILURES {
                        let excess = failures.len() - MAX_RETRY_FAILURES;
                        failures.drain(0..excess);
                    }

                    if attempt >= self.max_attempts {
                        return Err(ReliabilityError::RetryExhausted {
                            attempts: self.max_attempts,
                            failures,
                        });
                    }

                    let delay = self.jitter.apply(self.backoff.delay(attempt));
                    if let (Some(observer), Some(last)) = (&self.on_retry, failures.last()) {
                        observer(attempt, delay, last);
                    }
                    tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying");
                    self.sleeper.sleep(delay).await;
                }
                // Gate errors are not retried.
                Err(e) => return Err(e),
            }
        }

        unreachable!("retry loop returns from inside")
    }
}

/// Builder with validation.
pub struct RetryPolicyBuilder<E> {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    should_retry: RetryPredicate<E>,
    sleeper: Arc<dyn Sleeper>,
    on_retry: Option<RetryObserver<E>>,
}

impl<E> RetryPolicyBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::exponential(Duration::from_secs(1))
                .with_max(Duration::from_secs(10)),
            jitter: Jitter::None,
            should_retry: Arc::new(|_| true),
            sleeper: Arc::new(TokioSleeper),
            on_retry: None,
        }
    }

    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn should_retry(mut self, predicate: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        self.should_retry = Arc::new(predicate);
        self
    }

    pub fn sleeper(mut self, sleeper: impl Sleeper + 'static) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Observe each retry: attempt number, chosen delay, and the failure
    /// that caused it. The manager threads correlation ids through this.
    pub fn on_retry(
        mut self,
        observer: impl Fn(usize, Duration, &E) + Send + Sync + 'static,
    ) -> Self {
        self.on_retry = Some(Arc::new(observer));
        self
    }

    pub fn build(self) -> Result<RetryPolicy<E>, RetryBuildError> {
        if self.max_attempts == 0 {
            return Err(RetryBuildError::ZeroAttempts);
        }
        Ok(self.build_unchecked())
    }

    fn build_unchecked(self) -> RetryPolicy<E> {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            backoff: self.backoff,
            jitter: self.jitter,
            should_retry: self.should_retry,
            sleeper: self.sleeper,
            on_retry: self.on_retry,
        }
    }
}

impl<E> Default for RetryPolicyBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
