//! Convenient re-exports for the common Ballast types.
pub use crate::{
    Alert, AlertChannel, AlertCondition, AlertContext, AlertRule, AlertSink, AlertingService,
    Backoff, BackpressureConfig, BackpressureManager, BulkheadConfig, BulkheadPolicy,
    ChannelKind, CircuitBreaker, CircuitBreakerConfig, CircuitState, ErrorCategory, ErrorHandler,
    EventBus, FallbackChain, FixedWindowLimiter, HealthChecker, HealthProbe, HealthStatus,
    Jitter, OverflowStrategy, PolicyStack, ProbeReport, ReliabilityConfig, ReliabilityError,
    ReliabilityEvent, ReliabilityManager, ReliabilityReport, ResourceMonitor, RetryConfig,
    RetryPolicy, Severity, SystemHealth, TelemetryError, TelemetryEvent, TimeoutPolicy,
};
