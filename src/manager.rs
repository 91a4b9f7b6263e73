//! The reliability façade: owns every component and wires them together.
//!
//! The manager is the only place where components see each other, and they
//! do so through snapshots and hooks rather than back-references: errors
//! feed alerting through a context assembled on demand, resource alerts and
//! circuit transitions land on the event bus, and health probes read
//! manager state through a weak handle.

use crate::alerting::{
    Alert, AlertChannel, AlertContext, AlertRule, AlertSink, AlertingConfig, AlertingService,
};
use crate::backpressure::{
    BackpressureConfig, BackpressureConfigError, BackpressureManager, QueueStats,
};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState};
use crate::clock::{Clock, MonotonicClock};
use crate::error::{ErrorCategory, ReliabilityError, Severity, TelemetryError};
use crate::error_handler::{ErrorHandler, ErrorHandlerConfig, ErrorStats};
use crate::events::{EventBus, ReliabilityEvent, TelemetryEvent};
use crate::health::{
    FnProbe, HealthChecker, HealthConfig, HealthProbe, HealthResult, ProbeReport, SystemHealth,
};
use crate::rate_limit::{Decision, FixedWindowLimiter, RateLimitConfig, RateLimiterStats};
use crate::resource_monitor::{ResourceMonitor, ResourceMonitorConfig, ResourceSample};
use crate::retry::{RetryConfig, RetryPolicy, RetryPolicyBuilder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime};
use uuid::Uuid;

const DEFAULT_QUEUE: &str = "events";

/// Aggregate configuration with the documented defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReliabilityConfig {
    pub circuit: CircuitBreakerConfig,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub backpressure: BackpressureConfig,
    pub resources: ResourceMonitorConfig,
    pub errors: ErrorHandlerConfig,
    pub health: HealthConfig,
    pub alerting: AlertingConfig,
    /// Per-subscriber event bus buffer.
    pub event_bus_capacity: usize,
}

/// Rejected manager configurations.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Backpressure(#[from] BackpressureConfigError),
}

/// Unified snapshot returned by [`ReliabilityManager::reliability_report`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReliabilityReport {
    pub generated_at: SystemTime,
    pub health: Option<SystemHealth>,
    pub errors: ErrorStats,
    pub circuits: BTreeMap<String, CircuitSnapshot>,
    pub rate_limiter: RateLimiterStats,
    pub queues: BTreeMap<String, QueueStats>,
    pub resources: Option<ResourceSample>,
    pub recent_alerts: Vec<Alert>,
}

/// Owns one instance of every reliability component.
pub struct ReliabilityManager {
    config: ReliabilityConfig,
    errors: Arc<ErrorHandler>,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
    limiter: FixedWindowLimiter,
    queues: Mutex<HashMap<String, Arc<BackpressureManager<TelemetryEvent>>>>,
    resources: ResourceMonitor,
    health: Arc<HealthChecker>,
    alerting: Arc<AlertingService>,
    bus: EventBus,
    custom_metrics: Mutex<BTreeMap<String, f64>>,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    shut_down: AtomicBool,
    clock: Arc<dyn Clock>,
}

impl ReliabilityManager {
    /// Build the manager and wire component callbacks. Call
    /// [`start`](Self::start) afterwards to launch the periodic workers.
    pub fn new(config: ReliabilityConfig) -> Result<Arc<Self>, ConfigError> {
        Self::with_clock(config, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(
        config: ReliabilityConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>, ConfigError> {
        config.backpressure.validate()?;

        let manager = Arc::new_cyclic(|weak: &Weak<Self>| {
            let bus = EventBus::new(config.event_bus_capacity.max(16));

            let errors = Arc::new(ErrorHandler::with_clock(config.errors.clone(), clock.clone()));
            {
                let weak = weak.clone();
                errors.on_threshold(move |_, severity| {
                    if let Some(manager) = weak.upgrade() {
                        tracing::warn!(severity = %severity, "error threshold reached, evaluating alert rules");
                        manager.check_alerts();
                    }
                });
            }
            {
                let weak = weak.clone();
                errors.on_critical(move |_| {
                    if let Some(manager) = weak.upgrade() {
                        manager.check_alerts();
                    }
                });
            }

            let alerting = {
                let errors = errors.clone();
                let bus_for_alerts = bus.clone();
                Arc::new(
                    AlertingService::with_clock(config.alerting.clone(), clock.clone())
                        .with_sink_error_hook(move |err| errors.handle(err))
                        .with_fired_hook(move |rule, alert| {
                            bus_for_alerts.publish(ReliabilityEvent::AlertFired {
                                rule: rule.to_string(),
                                alert: alert.clone(),
                            });
                        }),
                )
            };

            let resources = {
                let weak = weak.clone();
                let bus = bus.clone();
                ResourceMonitor::new(config.resources.clone()).with_alert_hook(
                    move |kind, severity, value, threshold| {
                        bus.publish(ReliabilityEvent::ResourceAlert {
                            resource: kind,
                            severity,
                            value,
                            threshold,
                            at: SystemTime::now(),
                        });
                        if let Some(manager) = weak.upgrade() {
                            manager.check_alerts();
                        }
                    },
                )
            };

            let health = Arc::new(HealthChecker::new(config.health.clone()));
            Self::register_builtin_probes(&health, weak.clone(), &config);

            Self {
                limiter: FixedWindowLimiter::with_clock(config.rate_limit.clone(), clock.clone()),
                errors,
                breakers: Mutex::new(HashMap::new()),
                queues: Mutex::new(HashMap::new()),
                resources,
                health,
                alerting,
                bus,
                custom_metrics: Mutex::new(BTreeMap::new()),
                workers: Mutex::new(Vec::new()),
                shut_down: AtomicBool::new(false),
                clock,
                config,
            }
        });

        Ok(manager)
    }

    fn register_builtin_probes(
        health: &HealthChecker,
        weak: Weak<Self>,
        config: &ReliabilityConfig,
    ) {
        let error_window = config.errors.window;
        let high_threshold = config.errors.high_threshold;
        {
            let weak = weak.clone();
            let probe: Arc<dyn HealthProbe> =
                Arc::new(FnProbe::new(move || -> Result<ProbeReport, TelemetryError> {
                let Some(manager) = weak.upgrade() else {
                    return Ok(ProbeReport::unhealthy("reliability manager dropped"));
                };
                let recent = manager.errors.recent_errors(error_window);
                if recent.iter().any(|e| e.severity == Severity::Critical) {
                    Ok(ProbeReport::unhealthy("critical errors in window"))
                } else if recent.len() >= high_threshold {
                    Ok(ProbeReport::degraded(format!("{} errors in window", recent.len())))
                } else {
                    Ok(ProbeReport::healthy())
                }
            }));
            health.register("error_rate", probe, true);
        }
        {
            let weak = weak.clone();
            let probe: Arc<dyn HealthProbe> =
                Arc::new(FnProbe::new(move || -> Result<ProbeReport, TelemetryError> {
                let Some(manager) = weak.upgrade() else {
                    return Ok(ProbeReport::unhealthy("reliability manager dropped"));
                };
                let open = manager.open_circuits();
                if open > 2 {
                    Ok(ProbeReport::unhealthy(format!("{open} circuits open")))
                } else if open > 0 {
                    Ok(ProbeReport::degraded(format!("{open} circuits open")))
                } else {
                    Ok(ProbeReport::healthy())
                }
            }));
            health.register("circuit_breakers", probe, true);
        }
        {
            let weak = weak.clone();
            let thresholds = config.resources.thresholds.clone();
            let probe: Arc<dyn HealthProbe> =
                Arc::new(FnProbe::new(move || -> Result<ProbeReport, TelemetryError> {
                let Some(manager) = weak.upgrade() else {
                    return Ok(ProbeReport::unhealthy("reliability manager dropped"));
                };
                let Some(sample) = manager.resources.latest() else {
                    return Ok(ProbeReport::healthy());
                };
                let cpu = sample.cpu_percent;
                let memory = sample.memory_percent();
                if cpu >= thresholds.cpu_percent.critical
                    || memory >= thresholds.memory_percent.critical
                {
                    Ok(ProbeReport::unhealthy(format!("cpu {cpu:.0}%, memory {memory:.0}%")))
                } else if cpu >= thresholds.cpu_percent.warning
                    || memory >= thresholds.memory_percent.warning
                {
                    Ok(ProbeReport::degraded(format!("cpu {cpu:.0}%, memory {memory:.0}%")))
                } else {
                    Ok(ProbeReport::healthy())
                }
            }));
            health.register("resources", probe, true);
        }
        {
            let probe: Arc<dyn HealthProbe> =
                Arc::new(FnProbe::new(move || -> Result<ProbeReport, TelemetryError> {
                let Some(manager) = weak.upgrade() else {
                    return Ok(ProbeReport::unhealthy("reliability manager dropped"));
                };
                let stats = manager.backpressure_stats();
                if stats.values().any(|q| q.size >= q.max_size) {
                    Ok(ProbeReport::unhealthy("a queue is full"))
                } else if stats.values().any(|q| q.under_pressure) {
                    Ok(ProbeReport::degraded("a queue is under pressure"))
                } else {
                    Ok(ProbeReport::healthy())
                }
            }));
            health.register("backpressure", probe, true);
        }
    }

    /// Launch the periodic workers: resource sampler, health runner, and
    /// the sweeper that retires idle rate windows and circuit records.
    /// Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock().unwrap_or_else(|p| p.into_inner());
        if !workers.is_empty() || self.is_shut_down() {
            return;
        }
        workers.push(self.resources.start());
        workers.push(self.health.start_periodic());
        workers.push(self.limiter.spawn_sweeper(Duration::from_secs(60)));

        let weak = Arc::downgrade(self);
        workers.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else { break };
                manager.sweep_idle_breakers();
                manager.check_alerts();
            }
        }));
        tracing::info!("reliability manager started");
    }

    /// Stop every worker, close queues, and reject further work with
    /// `shutdown` errors. Already-spawned alert deliveries finish on their
    /// own; nothing new is accepted.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.resources.stop();
        self.health.stop();
        for worker in self.workers.lock().unwrap_or_else(|p| p.into_inner()).drain(..) {
            worker.abort();
        }
        {
            let mut queues = self.queues.lock().unwrap_or_else(|p| p.into_inner());
            for queue in queues.values() {
                queue.close();
            }
            queues.clear();
        }
        self.breakers.lock().unwrap_or_else(|p| p.into_inner()).clear();
        tracing::info!("reliability manager shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn shutdown_error(&self) -> TelemetryError {
        TelemetryError::new("reliability layer shut down", ErrorCategory::System, Severity::Medium)
            .with_context("shutdown", "true")
    }

    fn guard(&self) -> Result<(), TelemetryError> {
        if self.is_shut_down() {
            return Err(self.shutdown_error());
        }
        Ok(())
    }

    /// Enforce the per-key fixed window for `event` (key = category:action).
    pub fn check_rate_limit(&self, event: &TelemetryEvent) -> Result<(), TelemetryError> {
        self.guard()?;
        let key = event.rate_key();
        match self.limiter.check(&key) {
            Decision::Allowed { .. } => Ok(()),
            Decision::Denied { retry_after } => {
                let err = TelemetryError::new(
                    format!("rate limit exceeded for {key}"),
                    ErrorCategory::System,
                    Severity::Medium,
                )
                .retryable(false)
                .with_context("rate_key", key)
                .with_context("retry_after_ms", retry_after.as_millis().to_string())
                .with_event_ref(event.id.to_string());
                self.errors.handle(err.clone());
                Err(err)
            }
        }
    }

    fn breaker_for(&self, key: &str) -> CircuitBreaker {
        let mut breakers = self.breakers.lock().unwrap_or_else(|p| p.into_inner());
        breakers
            .entry(key.to_string())
            .or_insert_with(|| {
                let bus = self.bus.clone();
                let key = key.to_string();
                CircuitBreaker::new(self.config.circuit.clone())
                    .with_clock(self.clock.clone())
                    .with_transition_hook(move |from, to| {
                        bus.publish(ReliabilityEvent::CircuitStateChange {
                            key: key.clone(),
                            from,
                            to,
                            at: SystemTime::now(),
                        });
                    })
            })
            .clone()
    }

    fn category_for_key(key: &str) -> ErrorCategory {
        if key.starts_with("storage:") {
            ErrorCategory::Storage
        } else if key.starts_with("streaming:") {
            ErrorCategory::Streaming
        } else {
            ErrorCategory::System
        }
    }

    /// Run `operation` behind the circuit breaker registered for `key`.
    pub async fn execute_with_circuit_breaker<T, Fut, Op>(
        &self,
        key: &str,
        mut operation: Op,
    ) -> Result<T, TelemetryError>
    where
        T: Send,
        Fut: Future<Output = Result<T, TelemetryError>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        self.guard()?;
        let breaker = self.breaker_for(key);
        let result = breaker
            .execute(|| {
                let fut = operation();
                async move { fut.await.map_err(ReliabilityError::Inner) }
            })
            .await;

        match result {
            Ok(value) => Ok(value),
            Err(ReliabilityError::CircuitOpen { failures, retry_in }) => {
                let err = TelemetryError::new(
                    format!("circuit open for {key}"),
                    Self::category_for_key(key),
                    Severity::High,
                )
                .retryable(false)
                .with_context("operation", key)
                .with_context("circuit_state", "open")
                .with_context("failures", failures.to_string())
                .with_context("retry_in_ms", retry_in.as_millis().to_string());
                self.errors.handle(err.clone());
                Err(err)
            }
            Err(ReliabilityError::Inner(inner)) => {
                let state = breaker.state();
                let severity = if state == CircuitState::Open {
                    Severity::High
                } else {
                    Severity::Medium
                };
                let err = TelemetryError::new(
                    inner.message.clone(),
                    Self::category_for_key(key),
                    severity,
                )
                .retryable(inner.retryable)
                .with_cause(inner.to_string())
                .with_context("operation", key)
                .with_context("circuit_state", state.as_str());
                self.errors.handle(err.clone());
                Err(err)
            }
            Err(other) => Err(self.wrap_gate_error(other, key)),
        }
    }

    fn wrap_gate_error(
        &self,
        error: ReliabilityError<TelemetryError>,
        key: &str,
    ) -> TelemetryError {
        let err = TelemetryError::new(
            error.to_string(),
            ErrorCategory::System,
            Severity::Medium,
        )
        .retryable(false)
        .with_context("operation", key);
        self.errors.handle(err.clone());
        err
    }

    fn retry_policy(&self, correlation: Uuid, label: &str) -> RetryPolicy<TelemetryError> {
        let errors = self.errors.clone();
        let attempts = if self.config.retry.enabled {
            self.config.retry.max_retries.max(1)
        } else {
            1
        };
        let label = label.to_string();
        RetryPolicyBuilder::new()
            .max_attempts(attempts)
            .backoff(self.config.retry.backoff())
            .should_retry(move |e: &TelemetryError| errors.is_retryable(e))
            .on_retry(move |attempt, delay, err: &TelemetryError| {
                tracing::info!(
                    correlation = %correlation,
                    operation = %label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after transient failure"
                );
            })
            .build()
            .unwrap_or_else(|_| unreachable!("attempt count is clamped above zero"))
    }

    /// Retry `operation` per the configured backoff. Attempts share one
    /// correlation id; non-retryable failures short-circuit.
    pub async fn execute_with_retry<T, Fut, Op>(
        &self,
        mut operation: Op,
        context: Option<&str>,
    ) -> Result<T, TelemetryError>
    where
        T: Send,
        Fut: Future<Output = Result<T, TelemetryError>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        self.guard()?;
        let correlation = Uuid::new_v4();
        let label = context.unwrap_or("operation").to_string();
        let policy = self.retry_policy(correlation, &label);
        let errors = self.errors.clone();

        let result = policy
            .execute(|| {
                let fut = operation();
                let errors = errors.clone();
                let label = label.clone();
                async move {
                    match fut.await {
                        Ok(value) => Ok(value),
                        Err(err) => {
                            let err = match err.correlation_id {
                                Some(_) => err,
                                None => err.with_correlation(correlation),
                            }
                            .with_context("operation", label);
                            errors.handle(err.clone());
                            Err(ReliabilityError::Inner(err))
                        }
                    }
                }
            })
            .await;

        match result {
            Ok(value) => Ok(value),
            Err(ReliabilityError::RetryExhausted { attempts, failures }) => {
                let mut err = TelemetryError::new(
                    format!("operation '{label}' failed after {attempts} attempts"),
                    ErrorCategory::System,
                    Severity::High,
                )
                .retryable(false)
                .with_correlation(correlation)
                .with_context("operation", label.clone())
                .with_context("attempts", attempts.to_string());
                for (index, failure) in failures.iter().enumerate() {
                    err = err
                        .with_context(format!("attempt_{}", index + 1), failure.message.clone());
                }
                self.errors.handle(err.clone());
                Err(err)
            }
            Err(ReliabilityError::Inner(err)) => Err(err),
            Err(other) => Err(self.wrap_gate_error(other, &label)),
        }
    }

    /// Circuit + retry around `primary`; on failure, run `fallback`. A
    /// fallback failure is elevated to a critical error carrying both
    /// messages.
    pub async fn execute_with_graceful_degradation<T, PFut, P, FFut, F>(
        &self,
        key: &str,
        primary: P,
        fallback: F,
    ) -> Result<T, TelemetryError>
    where
        T: Send,
        P: FnMut() -> PFut + Send,
        PFut: Future<Output = Result<T, TelemetryError>> + Send,
        F: FnOnce() -> FFut,
        FFut: Future<Output = Result<T, TelemetryError>>,
    {
        self.guard()?;
        let correlation = Uuid::new_v4();
        let policy = self.retry_policy(correlation, key);
        let breaker = self.breaker_for(key);
        let errors = self.errors.clone();
        let primary = Arc::new(Mutex::new(primary));

        let attempted = policy
            .execute(|| {
                let breaker = breaker.clone();
                let primary = primary.clone();
                let errors = errors.clone();
                let key = key.to_string();
                async move {
                    let result = breaker
                        .execute(|| {
                            let fut = {
                                let mut primary =
                                    primary.lock().unwrap_or_else(|p| p.into_inner());
                                (*primary)()
                            };
                            async move { fut.await.map_err(ReliabilityError::Inner) }
                        })
                        .await;
                    match result {
                        Ok(value) => Ok(value),
                        Err(ReliabilityError::Inner(err)) => {
                            let err = match err.correlation_id {
                                Some(_) => err,
                                None => err.with_correlation(correlation),
                            }
                            .with_context("operation", key);
                            errors.handle(err.clone());
                            Err(ReliabilityError::Inner(err))
                        }
                        Err(gate) => Err(gate),
                    }
                }
            })
            .await;

        let primary_failure = match attempted {
            Ok(value) => return Ok(value),
            Err(ReliabilityError::RetryExhausted { attempts, failures }) => {
                let mut err = TelemetryError::new(
                    format!("operation '{key}' failed after {attempts} attempts"),
                    ErrorCategory::System,
                    Severity::High,
                )
                .retryable(false)
                .with_correlation(correlation)
                .with_context("operation", key)
                .with_context("attempts", attempts.to_string());
                for (index, failure) in failures.iter().enumerate() {
                    err = err
                        .with_context(format!("attempt_{}", index + 1), failure.message.clone());
                }
                self.errors.handle(err.clone());
                err
            }
            Err(ReliabilityError::CircuitOpen { failures, retry_in }) => {
                let err = TelemetryError::new(
                    format!("circuit open for {key}"),
                    Self::category_for_key(key),
                    Severity::High,
                )
                .retryable(false)
                .with_correlation(correlation)
                .with_context("operation", key)
                .with_context("circuit_state", "open")
                .with_context("failures", failures.to_string())
                .with_context("retry_in_ms", retry_in.as_millis().to_string());
                self.errors.handle(err.clone());
                err
            }
            Err(ReliabilityError::Inner(err)) => err,
            Err(other) => self.wrap_gate_error(other, key),
        };

        tracing::warn!(
            operation = key,
            correlation = %correlation,
            error = %primary_failure,
            "primary path failed, degrading to fallback"
        );

        match fallback().await {
            Ok(value) => Ok(value),
            Err(fallback_failure) => {
                let err = TelemetryError::new(
                    format!(
                        "primary and fallback both failed for '{key}': {}; fallback: {}",
                        primary_failure.message, fallback_failure.message
                    ),
                    ErrorCategory::System,
                    Severity::Critical,
                )
                .retryable(false)
                .with_correlation(correlation)
                .with_context("operation", key)
                .with_context("primary_error", primary_failure.message.clone())
                .with_context("fallback_error", fallback_failure.message.clone());
                self.errors.handle(err.clone());
                Err(err)
            }
        }
    }

    fn queue_handle(
        &self,
        name: &str,
    ) -> Result<Arc<BackpressureManager<TelemetryEvent>>, TelemetryError> {
        self.guard()?;
        let mut queues = self.queues.lock().unwrap_or_else(|p| p.into_inner());
        Ok(queues
            .entry(name.to_string())
            .or_insert_with(|| {
                let pressure_bus = self.bus.clone();
                let relief_bus = self.bus.clone();
                let pressure_name = name.to_string();
                let relief_name = name.to_string();
                Arc::new(
                    BackpressureManager::new(self.config.backpressure.clone())
                        .unwrap_or_else(|_| unreachable!("config validated at construction"))
                        .with_hooks(
                            move |level| {
                                pressure_bus.publish(ReliabilityEvent::Pressure {
                                    queue: pressure_name.clone(),
                                    level,
                                });
                            },
                            move || {
                                relief_bus.publish(ReliabilityEvent::Relief {
                                    queue: relief_name.clone(),
                                });
                            },
                        ),
                )
            })
            .clone())
    }

    /// Enqueue an event on the named queue (`None` = the default queue).
    pub async fn push_event(
        &self,
        queue: Option<&str>,
        event: TelemetryEvent,
    ) -> Result<bool, TelemetryError> {
        let queue = self.queue_handle(queue.unwrap_or(DEFAULT_QUEUE))?;
        queue.push(event).await.map_err(|_| self.shutdown_error())
    }

    /// Dequeue the next event, waiting while the queue is empty.
    pub async fn next_event(&self, queue: Option<&str>) -> Result<TelemetryEvent, TelemetryError> {
        let queue = self.queue_handle(queue.unwrap_or(DEFAULT_QUEUE))?;
        queue.pop().await.map_err(|_| self.shutdown_error())
    }

    /// Atomically drain the named queue.
    pub fn drain_queue(&self, queue: Option<&str>) -> Result<Vec<TelemetryEvent>, TelemetryError> {
        Ok(self.queue_handle(queue.unwrap_or(DEFAULT_QUEUE))?.drain())
    }

    pub fn backpressure_stats(&self) -> BTreeMap<String, QueueStats> {
        let queues = self.queues.lock().unwrap_or_else(|p| p.into_inner());
        queues.iter().map(|(name, q)| (name.clone(), q.stats())).collect()
    }

    /// Run every health probe now.
    pub async fn system_health(&self) -> SystemHealth {
        self.health.run_all().await
    }

    /// Run one named probe.
    pub async fn run_health_check(&self, name: &str) -> Option<HealthResult> {
        self.health.run_one(name).await
    }

    /// Latest cached rollup from the periodic runner.
    pub fn cached_health(&self) -> Option<SystemHealth> {
        self.health.cached().map(|h| (*h).clone())
    }

    pub fn register_health_probe(
        &self,
        name: impl Into<String>,
        probe: Arc<dyn HealthProbe>,
        required: bool,
    ) {
        self.health.register(name, probe, required);
    }

    pub fn add_alert_channel(&self, channel: AlertChannel, sink: Arc<dyn AlertSink>) {
        self.alerting.add_channel(channel, sink);
    }

    pub fn add_alert_rule(&self, rule: AlertRule) {
        self.alerting.add_rule(rule);
    }

    pub fn alert_history(&self, window: Option<Duration>) -> Vec<Alert> {
        self.alerting.history(window)
    }

    /// Publish a gauge for `custom` alert conditions.
    pub fn set_custom_metric(&self, name: impl Into<String>, value: f64) {
        self.custom_metrics
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(name.into(), value);
    }

    /// Evaluate alert rules against a fresh context snapshot.
    pub fn check_alerts(&self) -> Vec<Alert> {
        if self.is_shut_down() {
            return Vec::new();
        }
        let ctx = self.alert_context();
        self.alerting.check(&ctx)
    }

    fn alert_context(&self) -> AlertContext {
        let circuits = {
            let breakers = self.breakers.lock().unwrap_or_else(|p| p.into_inner());
            breakers.iter().map(|(key, b)| (key.clone(), b.state())).collect()
        };
        AlertContext {
            errors: self.errors.recent_errors(self.config.errors.window),
            circuits,
            rate_limiter: self.limiter.stats(),
            resources: self.resources.latest(),
            custom_metrics: self
                .custom_metrics
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .clone(),
        }
    }

    fn open_circuits(&self) -> usize {
        let breakers = self.breakers.lock().unwrap_or_else(|p| p.into_inner());
        breakers.values().filter(|b| b.state() == CircuitState::Open).count()
    }

    /// Retire circuit records unused for twice the circuit cooldown.
    fn sweep_idle_breakers(&self) {
        let stale_after = 2 * self.config.circuit.timeout.as_millis() as u64;
        let now = self.clock.now_millis();
        let mut breakers = self.breakers.lock().unwrap_or_else(|p| p.into_inner());
        let before = breakers.len();
        breakers.retain(|_, b| now.saturating_sub(b.last_used_millis()) <= stale_after);
        let removed = before - breakers.len();
        if removed > 0 {
            tracing::debug!(removed, "retired idle circuit records");
        }
    }

    /// Subscribe to pressure/relief, resource, circuit, and alert events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ReliabilityEvent> {
        self.bus.subscribe()
    }

    /// Report an error into the layer: classification counters, dedup,
    /// thresholds, and alert wiring all apply.
    pub fn handle_error(&self, err: TelemetryError) {
        self.errors.handle(err);
    }

    /// Classify and report a raw error.
    pub fn handle_raw_error(&self, raw: &(dyn std::error::Error + 'static)) -> TelemetryError {
        self.errors.handle_raw(raw)
    }

    pub fn error_stats(&self) -> ErrorStats {
        self.errors.stats()
    }

    /// Buffered error records inside `window`, newest last.
    pub fn recent_errors(&self, window: Duration) -> Vec<TelemetryError> {
        self.errors.recent_errors(window)
    }

    /// One snapshot across every component.
    pub fn reliability_report(&self) -> ReliabilityReport {
        let circuits = {
            let breakers = self.breakers.lock().unwrap_or_else(|p| p.into_inner());
            breakers.iter().map(|(key, b)| (key.clone(), b.snapshot())).collect()
        };
        ReliabilityReport {
            generated_at: SystemTime::now(),
            health: self.cached_health(),
            errors: self.errors.stats(),
            circuits,
            rate_limiter: self.limiter.stats(),
            queues: self.backpressure_stats(),
            resources: self.resources.latest().map(|s| (*s).clone()),
            recent_alerts: self.alerting.history(Some(Duration::from_secs(3_600))),
        }
    }
}

impl Drop for ReliabilityManager {
    fn drop(&mut self) {
        // Workers hold only weak handles, but stop them promptly anyway.
        self.resources.stop();
        self.health.stop();
    }
}
