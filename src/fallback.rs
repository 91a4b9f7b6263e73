//! Fallback combinators and declared-order policy composition.
//!
//! [`FallbackChain`] tries handlers in order until one succeeds; a fallback
//! can carry a condition that decides, given the previous failure, whether
//! it should run at all. [`PolicyStack`] composes the individual policies so
//! that the declared order retry → circuit breaker → bulkhead → timeout is
//! the execution order.

use crate::bulkhead::{BulkheadConfig, BulkheadPolicy};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::error::ReliabilityError;
use crate::retry::{RetryPolicy, RetryPolicyBuilder};
use crate::timeout::TimeoutPolicy;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Handler<T, E> =
    Arc<dyn Fn() -> BoxFuture<'static, Result<T, ReliabilityError<E>>> + Send + Sync>;
type SkipCondition<E> = Arc<dyn Fn(&ReliabilityError<E>) -> bool + Send + Sync>;

struct ChainStep<T, E> {
    handler: Handler<T, E>,
    /// Given the previous failure, should this fallback run? `None` always
    /// runs.
    condition: Option<SkipCondition<E>>,
}

/// Ordered list of handlers: primary first, fallbacks after.
pub struct FallbackChain<T, E> {
    steps: Vec<ChainStep<T, E>>,
}

impl<T, E> FallbackChain<T, E>
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn new<Fut, F>(primary: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ReliabilityError<E>>> + Send + 'static,
    {
        Self {
            steps: vec![ChainStep {
                handler: Arc::new(move || Box::pin(primary())),
                condition: None,
            }],
        }
    }

    /// Append an unconditional fallback.
    pub fn or<Fut, F>(mut self, fallback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ReliabilityError<E>>> + Send + 'static,
    {
        self.steps.push(ChainStep {
            handler: Arc::new(move || Box::pin(fallback())),
            condition: None,
        });
        self
    }

    /// Append a fallback that only runs when `condition` accepts the
    /// previous failure.
    pub fn or_if<Fut, F>(
        mut self,
        condition: impl Fn(&ReliabilityError<E>) -> bool + Send + Sync + 'static,
        fallback: F,
    ) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ReliabilityError<E>>> + Send + 'static,
    {
        self.steps.push(ChainStep {
            handler: Arc::new(move || Box::pin(fallback())),
            condition: Some(Arc::new(condition)),
        });
        self
    }

    /// Try each step in order; the first success wins. When everything
    /// fails, the last observed failure surfaces.
    pub async fn execute(&self) -> Result<T, ReliabilityError<E>> {
        let mut last_error: Option<ReliabilityError<E>> = None;

        for (index, step) in self.steps.iter().enumerate() {
            if index > 0 {
                if let (Some(condition), Some(error)) = (&step.condition, &last_error) {
                    if !condition(error) {
                        tracing::trace!(step = index, "fallback skipped by condition");
                        continue;
                    }
                }
            }
            match (step.handler)().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    tracing::debug!(step = index, error = %error, "chain step failed");
                    last_error = Some(error);
                }
            }
        }

        match last_error {
            Some(error) => Err(error),
            // The primary always runs, so a failure path recorded an error.
            None => unreachable!("chain has at least one step"),
        }
    }
}

/// Run `primary`; on failure run `fallback` with the failure in hand.
pub async fn with_fallback<T, E, PFut, P, FFut, F>(
    primary: P,
    fallback: F,
) -> Result<T, ReliabilityError<E>>
where
    E: std::error::Error + Send + Sync + 'static,
    P: FnOnce() -> PFut,
    PFut: Future<Output = Result<T, ReliabilityError<E>>>,
    F: FnOnce(ReliabilityError<E>) -> FFut,
    FFut: Future<Output = Result<T, ReliabilityError<E>>>,
{
    match primary().await {
        Ok(value) => Ok(value),
        Err(error) => {
            tracing::debug!(error = %error, "primary failed, running fallback");
            fallback(error).await
        }
    }
}

/// Composition of all four gate policies in declared order.
#[derive(Clone)]
pub struct PolicyStack<E> {
    retry: RetryPolicy<E>,
    circuit: CircuitBreaker,
    bulkhead: BulkheadPolicy,
    timeout: TimeoutPolicy,
}

impl<E> PolicyStack<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn builder() -> PolicyStackBuilder<E> {
        PolicyStackBuilder::new()
    }

    /// Execute through retry → circuit breaker → bulkhead → timeout.
    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T, ReliabilityError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, ReliabilityError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let op = Arc::new(Mutex::new(operation));

        self.retry
            .execute(|| {
                let op = op.clone();
                let circuit = self.circuit.clone();
                let bulkhead = self.bulkhead.clone();
                let timeout = self.timeout;
                async move {
                    circuit
                        .execute(|| {
                            let op = op.clone();
                            let bulkhead = bulkhead.clone();
                            async move {
                                bulkhead
                                    .execute(|| {
                                        let op = op.clone();
                                        async move {
                                            timeout
                                                .execute(|| {
                                                    let mut op = op
                                                        .lock()
                                                        .unwrap_or_else(|p| p.into_inner());
                                                    (*op)()
                                                })
                                                .await
                                        }
                                    })
                                    .await
                            }
                        })
                        .await
                }
            })
            .await
    }
}

/// Builder; unset layers get permissive defaults.
pub struct PolicyStackBuilder<E> {
    retry: Option<RetryPolicy<E>>,
    circuit: Option<CircuitBreaker>,
    bulkhead: Option<BulkheadPolicy>,
    timeout: Option<TimeoutPolicy>,
}

impl<E> PolicyStackBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self { retry: None, circuit: None, bulkhead: None, timeout: None }
    }

    pub fn retry(mut self, policy: RetryPolicy<E>) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn circuit_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.circuit = Some(breaker);
        self
    }

    pub fn bulkhead(mut self, bulkhead: BulkheadPolicy) -> Self {
        self.bulkhead = Some(bulkhead);
        self
    }

    pub fn timeout(mut self, timeout: TimeoutPolicy) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn build(self) -> PolicyStack<E> {
        PolicyStack {
            retry: self.retry.unwrap_or_else(|| {
                RetryPolicyBuilder::new()
                    .max_attempts(1)
                    .build()
                    .unwrap_or_else(|_| unreachable!("one attempt is always valid"))
            }),
            circuit: self
                .circuit
                .unwrap_or_else(|| CircuitBreaker::new(CircuitBreakerConfig::default())),
            bulkhead: self.bulkhead.unwrap_or_else(|| {
                BulkheadPolicy::new(BulkheadConfig::default())
                    .unwrap_or_else(|_| unreachable!("default bulkhead config is valid"))
            }),
            timeout: self.timeout.unwrap_or_else(|| {
                TimeoutPolicy::new(Duration::from_secs(30))
                    .unwrap_or_else(|_| unreachable!("default timeout is valid"))
            }),
        }
    }
}

impl<E> Default for PolicyStackBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::Backoff;
    use crate::error::{ErrorCategory, Severity, TelemetryError};
    use crate::sleeper::InstantSleeper;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn storage_error(message: &str) -> ReliabilityError<TelemetryError> {
        ReliabilityError::Inner(
            TelemetryError::new(message, ErrorCategory::Storage, Severity::High).retryable(true),
        )
    }

    #[tokio::test]
    async fn primary_success_skips_fallbacks() {
        let fallback_ran = Arc::new(AtomicUsize::new(0));
        let fallback_clone = fallback_ran.clone();
        let chain: FallbackChain<u32, TelemetryError> = FallbackChain::new(|| async { Ok(1) })
            .or(move || {
                let fallback = fallback_clone.clone();
                async move {
                    fallback.fetch_add(1, Ordering::SeqCst);
                    Ok(2)
                }
            });

        assert_eq!(chain.execute().await.unwrap(), 1);
        assert_eq!(fallback_ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn chain_walks_to_the_first_success() {
        let chain: FallbackChain<u32, TelemetryError> =
            FallbackChain::new(|| async { Err(storage_error("primary down")) })
                .or(|| async { Err(storage_error("replica down")) })
                .or(|| async { Ok(3) });

        assert_eq!(chain.execute().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn all_failures_surface_the_last_error() {
        let chain: FallbackChain<u32, TelemetryError> =
            FallbackChain::new(|| async { Err(storage_error("primary down")) })
                .or(|| async { Err(storage_error("replica down")) });

        let err = chain.execute().await.unwrap_err();
        assert!(err.to_string().contains("replica down"));
    }

    #[tokio::test]
    async fn conditional_fallback_is_skipped_when_condition_rejects() {
        let skipped = Arc::new(AtomicUsize::new(0));
        let skipped_clone = skipped.clone();
        let chain: FallbackChain<u32, TelemetryError> =
            FallbackChain::new(|| async { Err(storage_error("primary down")) })
                .or_if(
                    |err| err.is_timeout(), // only for timeouts
                    move || {
                        let skipped = skipped_clone.clone();
                        async move {
                            skipped.fetch_add(1, Ordering::SeqCst);
                            Ok(9)
                        }
                    },
                )
                .or(|| async { Ok(4) });

        assert_eq!(chain.execute().await.unwrap(), 4);
        assert_eq!(skipped.load(Ordering::SeqCst), 0, "timeout-only fallback never ran");
    }

    #[tokio::test]
    async fn with_fallback_hands_the_failure_over() {
        let result = with_fallback(
            || async { Err::<u32, _>(storage_error("primary down")) },
            |err| async move {
                assert!(err.to_string().contains("primary down"));
                Ok(10)
            },
        )
        .await;
        assert_eq!(result.unwrap(), 10);
    }

    #[tokio::test]
    async fn stack_retries_through_all_layers() {
        let retry = RetryPolicy::builder()
            .max_attempts(3)
            .backoff(Backoff::constant(Duration::from_millis(1)))
            .sleeper(InstantSleeper)
            .build()
            .unwrap();
        let stack: PolicyStack<TelemetryError> = PolicyStack::builder().retry(retry).build();

        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let result = stack
            .execute(move || {
                let attempts = attempts_clone.clone();
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(storage_error("transient"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stack_timeout_applies_to_the_operation() {
        let stack: PolicyStack<TelemetryError> = PolicyStack::builder()
            .timeout(TimeoutPolicy::new(Duration::from_millis(20)).unwrap())
            .build();

        let result = stack
            .execute(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, ReliabilityError<TelemetryError>>(1)
            })
            .await;
        assert!(result.unwrap_err().is_timeout());
    }
}
