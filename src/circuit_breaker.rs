//! Three-state failure gate built on lock-free atomics.
//!
//! `closed → open` after a run of consecutive failures, `open → half-open`
//! once the cooldown elapses, and `half-open → closed` only after the
//! configured number of probe successes. A compare-and-swap on the state
//! byte decides every transition, and a probe flag admits exactly one test
//! call at a time while half-open.

use crate::clock::{Clock, MonotonicClock};
use crate::error::ReliabilityError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }

    fn from_raw(raw: u8) -> Self {
        match raw {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Breaker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    /// Consecutive failures that open the circuit.
    pub threshold: usize,
    /// Cooldown before an open circuit admits a probe.
    pub timeout: Duration,
    /// Probe successes required to close again.
    pub half_open_required: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 5,
            timeout: Duration::from_secs(60),
            half_open_required: 3,
        }
    }
}

/// Point-in-time view of a breaker, used in reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: usize,
    pub half_open_successes: usize,
    pub last_failure_at_millis: Option<u64>,
    pub total_requests: u64,
}

struct Shared {
    state: AtomicU8,
    failures: AtomicUsize,
    half_open_successes: AtomicUsize,
    probe_in_flight: AtomicBool,
    last_failure_at: AtomicU64,
    has_failed: AtomicBool,
    total_requests: AtomicU64,
    last_used_at: AtomicU64,
}

type TransitionHook = Arc<dyn Fn(CircuitState, CircuitState) + Send + Sync>;

/// Failure gate around an async operation.
#[derive(Clone)]
pub struct CircuitBreaker {
    shared: Arc<Shared>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    on_transition: Option<TransitionHook>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: AtomicU8::new(STATE_CLOSED),
                failures: AtomicUsize::new(0),
                half_open_successes: AtomicUsize::new(0),
                probe_in_flight: AtomicBool::new(false),
                last_failure_at: AtomicU64::new(0),
                has_failed: AtomicBool::new(false),
                total_requests: AtomicU64::new(0),
                last_used_at: AtomicU64::new(0),
            }),
            config,
            clock: Arc::new(MonotonicClock::default()),
            on_transition: None,
        }
    }

    /// Override the clock for deterministic tests.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Observe state transitions (wired to the event bus by the manager).
    /// The hook runs on the caller that performed the transition; it must
    /// not block.
    pub fn with_transition_hook(
        mut self,
        hook: impl Fn(CircuitState, CircuitState) + Send + Sync + 'static,
    ) -> Self {
        self.on_transition = Some(Arc::new(hook));
        self
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_raw(self.shared.state.load(Ordering::Acquire))
    }

    /// Clock offset of the most recent call, for idle sweeping.
    pub fn last_used_millis(&self) -> u64 {
        self.shared.last_used_at.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        CircuitSnapshot {
            state: self.state(),
            failure_count: self.shared.failures.load(Ordering::Acquire),
            half_open_successes: self.shared.half_open_successes.load(Ordering::Acquire),
            last_failure_at_millis: if self.shared.has_failed.load(Ordering::Acquire) {
                Some(self.shared.last_failure_at.load(Ordering::Acquire))
            } else {
                None
            },
            total_requests: self.shared.total_requests.load(Ordering::Acquire),
        }
    }

    /// Reset to closed, clearing all counters.
    pub fn reset(&self) {
        let before = self.state();
        self.shared.state.store(STATE_CLOSED, Ordering::Release);
        self.shared.failures.store(0, Ordering::Release);
        self.shared.half_open_successes.store(0, Ordering::Release);
        self.shared.probe_in_flight.store(false, Ordering::Release);
        if before != CircuitState::Closed {
            self.transition(before, CircuitState::Closed);
        }
    }

    /// Run `operation` through the gate.
    pub async fn execute<T, E, Fut, Op>(&self, mut operation: Op) -> Result<T, ReliabilityError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ReliabilityError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        self.shared.last_used_at.store(self.clock.now_millis(), Ordering::Release);
        if !self.config.enabled {
            return operation().await;
        }

        let mut holds_probe = false;
        loop {
            match self.shared.state.load(Ordering::Acquire) {
                STATE_OPEN => {
                    let last_failure = self.shared.last_failure_at.load(Ordering::Acquire);
                    let elapsed = self.clock.now_millis().saturating_sub(last_failure);
                    let cooldown = self.config.timeout.as_millis() as u64;

                    if elapsed >= cooldown {
                        match self.shared.state.compare_exchange(
                            STATE_OPEN,
                            STATE_HALF_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        ) {
                            Ok(_) => {
                                self.shared.half_open_successes.store(0, Ordering::Release);
                                self.shared.probe_in_flight.store(false, Ordering::Release);
                                self.transition(CircuitState::Open, CircuitState::HalfOpen);
                                continue;
                            }
                            Err(_) => continue,
                        }
                    }
                    return Err(ReliabilityError::CircuitOpen {
                        failures: self.shared.failures.load(Ordering::Acquire),
                        retry_in: Duration::from_millis(cooldown - elapsed),
                    });
                }
                STATE_HALF_OPEN => {
                    // One probe at a time; the rest fail fast.
                    if self
                        .shared
                        .probe_in_flight
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        holds_probe = true;
                        tracing::debug!("circuit half-open: probe admitted");
                        break;
                    }
                    return Err(ReliabilityError::CircuitOpen {
                        failures: self.shared.failures.load(Ordering::Acquire),
                        retry_in: Duration::ZERO,
                    });
                }
                _ => break,
            }
        }

        self.shared.total_requests.fetch_add(1, Ordering::AcqRel);
        let result = operation().await;

        if holds_probe {
            self.shared.probe_in_flight.store(false, Ordering::Release);
        }

        match &result {
            Ok(_) => self.on_success(),
            Err(_) => self.on_failure(),
        }
        result
    }

    fn on_success(&self) {
        match self.shared.state.load(Ordering::Acquire) {
            STATE_HALF_OPEN => {
                let successes = self.shared.half_open_successes.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.half_open_required
                    && self
                        .shared
                        .state
                        .compare_exchange(
                            STATE_HALF_OPEN,
                            STATE_CLOSED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    self.shared.failures.store(0, Ordering::Release);
                    self.shared.half_open_successes.store(0, Ordering::Release);
                    self.transition(CircuitState::HalfOpen, CircuitState::Closed);
                }
            }
            STATE_CLOSED => {
                self.shared.failures.store(0, Ordering::Release);
            }
            _ => {}
        }
    }

    fn on_failure(&self) {
        let now = self.clock.now_millis();
        self.shared.last_failure_at.store(now, Ordering::Release);
        self.shared.has_failed.store(true, Ordering::Release);
        let failures = self.shared.failures.fetch_add(1, Ordering::AcqRel) + 1;

        match self.shared.state.load(Ordering::Acquire) {
            STATE_HALF_OPEN => {
                if self
                    .shared
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    tracing::warn!(failures, "circuit probe failed, reopening");
                    self.transition(CircuitState::HalfOpen, CircuitState::Open);
                }
            }
            STATE_CLOSED => {
                if failures >= self.config.threshold
                    && self
                        .shared
                        .state
                        .compare_exchange(
                            STATE_CLOSED,
                            STATE_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    tracing::error!(
                        failures,
                        threshold = self.config.threshold,
                        "circuit opened"
                    );
                    self.transition(CircuitState::Closed, CircuitState::Open);
                }
            }
            _ => {}
        }
    }

    fn transition(&self, from: CircuitState, to: CircuitState) {
        tracing::info!(from = %from, to = %to, "circuit state change");
        if let Some(hook) = &self.on_transition {
            hook(from, to);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::{ErrorCategory, Severity, TelemetryError};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_error() -> TelemetryError {
        TelemetryError::new("probe failure", ErrorCategory::Network, Severity::Medium)
    }

    fn breaker(threshold: usize, timeout_millis: u64, required: usize) -> (CircuitBreaker, ManualClock) {
        let clock = ManualClock::new();
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            enabled: true,
            threshold,
            timeout: Duration::from_millis(timeout_millis),
            half_open_required: required,
        })
        .with_clock(Arc::new(clock.clone()));
        (breaker, clock)
    }

    async fn fail(breaker: &CircuitBreaker) {
        let _ = breaker
            .execute(|| async { Err::<(), _>(ReliabilityError::Inner(test_error())) })
            .await;
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<u32, ReliabilityError<TelemetryError>> {
        breaker.execute(|| async { Ok::<_, ReliabilityError<TelemetryError>>(42) }).await
    }

    #[tokio::test]
    async fn starts_closed_and_passes_through() {
        let (breaker, _) = breaker(3, 500, 2);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(succeed(&breaker).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn opens_after_consecutive_failures() {
        let (breaker, _) = breaker(3, 500, 2);
        for _ in 0..3 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        let result = breaker
            .execute(|| {
                let counter = counter_clone.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ReliabilityError<TelemetryError>>(1)
                }
            })
            .await;
        assert!(result.unwrap_err().is_circuit_open());
        assert_eq!(counter.load(Ordering::SeqCst), 0, "open circuit must not run the operation");
    }

    #[tokio::test]
    async fn success_in_closed_state_resets_the_failure_run() {
        let (breaker, _) = breaker(3, 500, 2);
        fail(&breaker).await;
        fail(&breaker).await;
        succeed(&breaker).await.unwrap();
        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn cooldown_admits_a_probe_and_two_successes_close() {
        let (breaker, clock) = breaker(3, 500, 2);
        for _ in 0..3 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(100);
        assert!(succeed(&breaker).await.is_err(), "still cooling down at t=100");

        clock.advance(500);
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen, "one success is not enough");
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn probe_failure_reopens() {
        let (breaker, clock) = breaker(2, 500, 2);
        fail(&breaker).await;
        fail(&breaker).await;
        clock.advance(600);
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn half_open_admits_one_probe_at_a_time() {
        let (breaker, clock) = breaker(2, 100, 1);
        fail(&breaker).await;
        fail(&breaker).await;
        clock.advance(150);

        let gate = Arc::new(tokio::sync::Barrier::new(2));
        let running = Arc::new(AtomicUsize::new(0));

        let probe_breaker = breaker.clone();
        let probe_gate = gate.clone();
        let probe_running = running.clone();
        let probe = tokio::spawn(async move {
            probe_breaker
                .execute(|| {
                    let gate = probe_gate.clone();
                    let running = probe_running.clone();
                    async move {
                        running.fetch_add(1, Ordering::SeqCst);
                        gate.wait().await;
                        Ok::<_, ReliabilityError<TelemetryError>>(7)
                    }
                })
                .await
        });

        // Wait until the probe is in flight, then try to sneak in.
        while running.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        let second = succeed(&breaker).await;
        assert!(second.unwrap_err().is_circuit_open(), "second half-open caller fails fast");

        gate.wait().await;
        assert_eq!(probe.await.unwrap().unwrap(), 7);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn disabled_breaker_never_opens() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            enabled: false,
            threshold: 1,
            timeout: Duration::from_secs(60),
            half_open_required: 1,
        });
        for _ in 0..10 {
            fail(&breaker).await;
        }
        assert_eq!(succeed(&breaker).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn transition_hook_sees_the_legal_path() {
        let transitions = Arc::new(std::sync::Mutex::new(Vec::new()));
        let transitions_clone = transitions.clone();
        let clock = ManualClock::new();
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            enabled: true,
            threshold: 2,
            timeout: Duration::from_millis(100),
            half_open_required: 1,
        })
        .with_clock(Arc::new(clock.clone()))
        .with_transition_hook(move |from, to| {
            transitions_clone.lock().unwrap().push((from, to));
        });

        fail(&breaker).await;
        fail(&breaker).await;
        clock.advance(150);
        succeed(&breaker).await.unwrap();

        let seen = transitions.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }

    #[tokio::test]
    async fn snapshot_reflects_counters() {
        let (breaker, _) = breaker(5, 500, 2);
        fail(&breaker).await;
        succeed(&breaker).await.unwrap();
        let snap = breaker.snapshot();
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.failure_count, 0);
        assert_eq!(snap.total_requests, 2);
        assert!(snap.last_failure_at_millis.is_some());
    }
}
