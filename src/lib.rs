#![forbid(unsafe_code)]

//! # Ballast
//!
//! A reliability layer for telemetry pipelines: composable resilience
//! policies coordinated by a single manager that classifies errors, threads
//! correlation through retries, escalates to alerts, and reports unified
//! health.
//!
//! ## Components
//!
//! - **Error handling**: classification, deduplication, ring-buffered
//!   history, and severity thresholds ([`ErrorHandler`])
//! - **Circuit breakers** with CAS-admitted half-open probes
//!   ([`CircuitBreaker`])
//! - **Rate limiting** with per-key fixed windows ([`FixedWindowLimiter`])
//! - **Backpressure**: bounded queues with watermark hysteresis and
//!   pluggable overflow strategies ([`BackpressureManager`])
//! - **Resource monitoring**: CPU/memory/scheduler-lag sampling with
//!   threshold alerts ([`ResourceMonitor`])
//! - **Health checks** with parallel probes and required/optional rollup
//!   ([`HealthChecker`])
//! - **Alert routing**: rule engine over reliability metrics with pluggable
//!   sinks ([`AlertingService`])
//! - **Retry / timeout / bulkhead / fallback** combinators and declared-order
//!   composition ([`RetryPolicy`], [`TimeoutPolicy`], [`BulkheadPolicy`],
//!   [`FallbackChain`], [`PolicyStack`])
//! - **The façade**: [`ReliabilityManager`] owns one of each and wires them
//!   together
//!
//! ## Quick start
//!
//! ```rust
//! use ballast::{ReliabilityConfig, ReliabilityManager, TelemetryEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = ReliabilityManager::new(ReliabilityConfig::default())?;
//!     manager.start();
//!
//!     // Gate an event through the rate limiter and queue it.
//!     let event = TelemetryEvent::new("ingest", "flush");
//!     manager.check_rate_limit(&event)?;
//!     manager.push_event(None, event).await?;
//!
//!     // Run an operation with retry; attempts share one correlation id.
//!     let value = manager
//!         .execute_with_retry(
//!             || async { Ok::<_, ballast::TelemetryError>(42) },
//!             Some("demo"),
//!         )
//!         .await?;
//!     assert_eq!(value, 42);
//!
//!     manager.shutdown();
//!     Ok(())
//! }
//! ```

mod alerting;
mod backoff;
mod backpressure;
mod bulkhead;
mod circuit_breaker;
mod clock;
mod error;
mod error_handler;
mod events;
mod fallback;
mod health;
mod jitter;
mod manager;
mod rate_limit;
mod resource_monitor;
mod retry;
mod sleeper;
mod timeout;

// Re-exports
pub use alerting::{
    Alert, AlertChannel, AlertCondition, AlertContext, AlertRule, AlertSink, AlertingConfig,
    AlertingService, ChannelKind, LogSink, MemorySink,
};
pub use backoff::Backoff;
pub use backpressure::{
    BackpressureConfig, BackpressureConfigError, BackpressureManager, OverflowStrategy, QueueStats,
};
pub use bulkhead::{BulkheadConfig, BulkheadConfigError, BulkheadPolicy};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState,
};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use error::{
    ErrorCategory, ReliabilityError, Severity, TelemetryError, DEDUP_MESSAGE_PREFIX,
    MAX_RETRY_FAILURES,
};
pub use error_handler::{ErrorHandler, ErrorHandlerConfig, ErrorStats};
pub use events::{EventBus, ReliabilityEvent, TelemetryEvent};
pub use fallback::{with_fallback, FallbackChain, PolicyStack, PolicyStackBuilder};
pub use health::{
    FnProbe, HealthChecker, HealthConfig, HealthProbe, HealthResult, HealthStatus, ProbeReport,
    SystemHealth,
};
pub use jitter::Jitter;
pub use manager::{ConfigError, ReliabilityConfig, ReliabilityManager, ReliabilityReport};
pub use rate_limit::{Decision, FixedWindowLimiter, RateLimitConfig, RateLimiterStats};
pub use resource_monitor::{
    GcSignal, ResourceAggregate, ResourceKind, ResourceMonitor, ResourceMonitorConfig,
    ResourceSample, ResourceThresholds, ThresholdPair,
};
pub use retry::{RetryBuildError, RetryConfig, RetryPolicy, RetryPolicyBuilder};
pub use sleeper::{InstantSleeper, RecordingSleeper, Sleeper, TokioSleeper};
pub use timeout::{TimeoutConfigError, TimeoutPolicy, MAX_TIMEOUT};

pub mod prelude;
