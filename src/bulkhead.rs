//! Concurrency isolation with a bounded waiter queue.
//!
//! A semaphore caps in-flight operations. When every permit is taken,
//! callers queue up to `max_queued` deep; past that the bulkhead rejects
//! with a capacity error, and a waiting caller that outlives the optional
//! acquire timeout fails with a timeout.

use crate::error::ReliabilityError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;

/// Bulkhead tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkheadConfig {
    pub max_concurrent: usize,
    /// Callers allowed to wait for a permit once all are taken.
    pub max_queued: usize,
    /// How long a queued caller may wait. `None` waits indefinitely.
    pub acquire_timeout: Option<Duration>,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self { max_concurrent: 32, max_queued: 64, acquire_timeout: Some(Duration::from_secs(10)) }
    }
}

/// Rejected bulkhead configurations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BulkheadConfigError {
    #[error("max_concurrent must be > 0")]
    ZeroConcurrency,
}

/// Semaphore-backed concurrency limiter.
#[derive(Debug, Clone)]
pub struct BulkheadPolicy {
    semaphore: Arc<Semaphore>,
    queued: Arc<AtomicUsize>,
    config: BulkheadConfig,
}

impl BulkheadPolicy {
    pub fn new(config: BulkheadConfig) -> Result<Self, BulkheadConfigError> {
        if config.max_concurrent == 0 {
            return Err(BulkheadConfigError::ZeroConcurrency);
        }
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            queued: Arc::new(AtomicUsize::new(0)),
            config,
        })
    }

    /// Permits currently available.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Callers currently parked waiting for a permit.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    /// Run `operation` under a permit.
    pub async fn execute<T, E, Fut, Op>(&self, mut operation: Op) -> Result<T, ReliabilityError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ReliabilityError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let permit = match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                // All permits taken; join the bounded waiter queue.
                let waiting = self.queued.fetch_add(1, Ordering::AcqRel);
                if waiting >= self.config.max_queued {
                    self.queued.fetch_sub(1, Ordering::AcqRel);
                    let in_flight = self
                        .config
                        .max_concurrent
                        .saturating_sub(self.semaphore.available_permits());
                    tracing::warn!(
                        in_flight,
                        queued = waiting,
                        "bulkhead queue full, rejecting"
                    );
                    return Err(ReliabilityError::Capacity {
                        in_flight,
                        max: self.config.max_concurrent,
                    });
                }

                let started = Instant::now();
                let acquired = match self.config.acquire_timeout {
                    Some(limit) => {
                        match tokio::time::timeout(limit, self.semaphore.clone().acquire_owned())
                            .await
                        {
                            Ok(result) => result.map_err(|_| None),
                            Err(_) => Err(Some(ReliabilityError::Timeout {
                                elapsed: started.elapsed(),
                                limit,
                            })),
                        }
                    }
                    None => self.semaphore.clone().acquire_owned().await.map_err(|_| None),
                };
                self.queued.fetch_sub(1, Ordering::AcqRel);

                match acquired {
                    Ok(permit) => permit,
                    Err(Some(timeout_err)) => return Err(timeout_err),
                    // The semaphore only closes on shutdown.
                    Err(None) => return Err(ReliabilityError::Shutdown),
                }
            }
        };

        let result = operation().await;
        drop(permit);
        result
    }

    /// Reject all current and future waiters with `Shutdown`.
    pub fn close(&self) {
        self.semaphore.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorCategory, Severity, TelemetryError};
    use std::sync::atomic::AtomicUsize;

    fn bulkhead(concurrent: usize, queued: usize) -> BulkheadPolicy {
        BulkheadPolicy::new(BulkheadConfig {
            max_concurrent: concurrent,
            max_queued: queued,
            acquire_timeout: Some(Duration::from_secs(5)),
        })
        .unwrap()
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let result = BulkheadPolicy::new(BulkheadConfig {
            max_concurrent: 0,
            max_queued: 1,
            acquire_timeout: None,
        });
        assert_eq!(result.unwrap_err(), BulkheadConfigError::ZeroConcurrency);
    }

    #[tokio::test]
    async fn sequential_operations_all_pass() {
        let bulkhead = bulkhead(2, 0);
        for i in 0..5 {
            let result = bulkhead
                .execute(|| async move { Ok::<_, ReliabilityError<TelemetryError>>(i) })
                .await;
            assert_eq!(result.unwrap(), i);
        }
    }

    #[tokio::test]
    async fn over_queue_rejects_with_capacity() {
        let bulkhead = Arc::new(bulkhead(1, 0));
        let gate = Arc::new(tokio::sync::Barrier::new(2));

        let holder = {
            let bulkhead = bulkhead.clone();
            let gate = gate.clone();
            tokio::spawn(async move {
                bulkhead
                    .execute(|| {
                        let gate = gate.clone();
                        async move {
                            gate.wait().await;
                            Ok::<_, ReliabilityError<TelemetryError>>(())
                        }
                    })
                    .await
            })
        };

        // Let the holder take the only permit.
        while bulkhead.available() > 0 {
            tokio::task::yield_now().await;
        }

        let rejected = bulkhead
            .execute(|| async { Ok::<_, ReliabilityError<TelemetryError>>(()) })
            .await;
        match rejected.unwrap_err() {
            ReliabilityError::Capacity { in_flight, max } => {
                assert_eq!(in_flight, 1);
                assert_eq!(max, 1);
            }
            other => panic!("expected capacity, got {other:?}"),
        }

        gate.wait().await;
        holder.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn queued_callers_run_once_a_permit_frees() {
        let bulkhead = Arc::new(bulkhead(1, 4));
        let order = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..3 {
            let bulkhead = bulkhead.clone();
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                bulkhead
                    .execute(|| {
                        let order = order.clone();
                        async move {
                            order.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            Ok::<_, ReliabilityError<TelemetryError>>(())
                        }
                    })
                    .await
            }));
        }

        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(order.load(Ordering::SeqCst), 3, "all queued callers eventually ran");
    }

    #[tokio::test]
    async fn waiter_times_out() {
        let bulkhead = Arc::new(BulkheadPolicy::new(BulkheadConfig {
            max_concurrent: 1,
            max_queued: 4,
            acquire_timeout: Some(Duration::from_millis(20)),
        })
        .unwrap());

        let gate = Arc::new(tokio::sync::Barrier::new(2));
        let holder = {
            let bulkhead = bulkhead.clone();
            let gate = gate.clone();
            tokio::spawn(async move {
                bulkhead
                    .execute(|| {
                        let gate = gate.clone();
                        async move {
                            gate.wait().await;
                            Ok::<_, ReliabilityError<TelemetryError>>(())
                        }
                    })
                    .await
            })
        };
        while bulkhead.available() > 0 {
            tokio::task::yield_now().await;
        }

        let waited = bulkhead
            .execute(|| async { Ok::<_, ReliabilityError<TelemetryError>>(()) })
            .await;
        assert!(waited.unwrap_err().is_timeout());

        gate.wait().await;
        holder.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn close_evicts_waiters_with_shutdown() {
        let bulkhead = Arc::new(BulkheadPolicy::new(BulkheadConfig {
            max_concurrent: 1,
            max_queued: 4,
            acquire_timeout: None,
        })
        .unwrap());

        let gate = Arc::new(tokio::sync::Barrier::new(2));
        let holder = {
            let bulkhead = bulkhead.clone();
            let gate = gate.clone();
            tokio::spawn(async move {
                bulkhead
                    .execute(|| {
                        let gate = gate.clone();
                        async move {
                            gate.wait().await;
                            Ok::<_, ReliabilityError<TelemetryError>>(())
                        }
                    })
                    .await
            })
        };
        while bulkhead.available() > 0 {
            tokio::task::yield_now().await;
        }

        let waiter = {
            let bulkhead = bulkhead.clone();
            tokio::spawn(async move {
                bulkhead
                    .execute(|| async { Ok::<_, ReliabilityError<TelemetryError>>(()) })
                    .await
            })
        };
        while bulkhead.queued() == 0 {
            tokio::task::yield_now().await;
        }

        bulkhead.close();
        assert!(waiter.await.unwrap().unwrap_err().is_shutdown());

        gate.wait().await;
        let _ = holder.await.unwrap();
    }

    #[tokio::test]
    async fn operation_errors_pass_through() {
        let bulkhead = bulkhead(2, 2);
        let result: Result<(), _> = bulkhead
            .execute(|| async {
                Err(ReliabilityError::Inner(TelemetryError::new(
                    "export failed",
                    ErrorCategory::Network,
                    Severity::Medium,
                )))
            })
            .await;
        assert!(result.unwrap_err().is_inner());
    }
}
