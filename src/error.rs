//! Error model: classified telemetry errors and the unified policy error.
//!
//! Two layers:
//! - [`TelemetryError`] is the concrete, classified error the manager hands
//!   to callers: category, severity, retryability, context map, correlation.
//! - [`ReliabilityError`] is the generic error every policy speaks. Gate
//!   rejections (timeout, open circuit, rate limit, capacity) are first-class
//!   variants; the wrapped operation's own failure travels as `Inner`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, SystemTime};
use uuid::Uuid;

/// Cap on failures recorded inside `RetryExhausted` so the log cannot grow
/// without bound.
pub const MAX_RETRY_FAILURES: usize = 10;

/// Number of leading message bytes that participate in deduplication.
pub const DEDUP_MESSAGE_PREFIX: usize = 128;

/// Where in the pipeline an error originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Validation,
    Storage,
    Streaming,
    Network,
    System,
    User,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::Storage => "storage",
            ErrorCategory::Streaming => "streaming",
            ErrorCategory::Network => "network",
            ErrorCategory::System => "system",
            ErrorCategory::User => "user",
        }
    }

    /// Categories whose failures are transient by nature.
    pub fn transient(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Network | ErrorCategory::Storage | ErrorCategory::Streaming
        )
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How urgent an error is. Ordered so `Critical` compares greatest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified error flowing through the reliability layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryError {
    pub id: Uuid,
    pub timestamp: SystemTime,
    pub message: String,
    pub cause: Option<String>,
    pub category: ErrorCategory,
    pub severity: Severity,
    pub retryable: bool,
    pub context: BTreeMap<String, String>,
    pub correlation_id: Option<Uuid>,
    pub event_ref: Option<String>,
}

impl TelemetryError {
    pub fn new(
        message: impl Into<String>,
        category: ErrorCategory,
        severity: Severity,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: SystemTime::now(),
            message: message.into(),
            cause: None,
            category,
            severity,
            retryable: false,
            context: BTreeMap::new(),
            correlation_id: None,
            event_ref: None,
        }
    }

    /// Wrap a raw error, classifying it from its message.
    ///
    /// Network-ish and timeout-ish messages classify as retryable
    /// `Network/Medium`; permission and malformed-input messages as
    /// `Validation/Medium`; everything else as non-retryable `System/Medium`.
    pub fn classify(raw: &(dyn std::error::Error + 'static)) -> Self {
        let message = raw.to_string();
        let lowered = message.to_ascii_lowercase();
        let cause = raw.source().map(|s| s.to_string());

        let (category, retryable) = if ["network", "timeout", "timed out", "connection", "econn"]
            .iter()
            .any(|needle| lowered.contains(needle))
        {
            (ErrorCategory::Network, true)
        } else if ["permission", "unauthorized", "forbidden", "invalid", "bad request"]
            .iter()
            .any(|needle| lowered.contains(needle))
        {
            (ErrorCategory::Validation, false)
        } else {
            (ErrorCategory::System, false)
        };

        let mut err = Self::new(message, category, Severity::Medium);
        err.retryable = retryable;
        err.cause = cause;
        err
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_event_ref(mut self, event_ref: impl Into<String>) -> Self {
        self.event_ref = Some(event_ref.into());
        self
    }

    /// Key used to collapse repeats: category, severity, and the first
    /// [`DEDUP_MESSAGE_PREFIX`] bytes of the message.
    pub fn dedup_key(&self) -> (ErrorCategory, Severity, String) {
        let prefix = self
            .message
            .char_indices()
            .take_while(|(i, _)| *i < DEDUP_MESSAGE_PREFIX)
            .map(|(_, c)| c)
            .collect();
        (self.category, self.severity, prefix)
    }
}

impl fmt::Display for TelemetryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}: {}", self.category, self.severity, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, " (caused by: {cause})")?;
        }
        Ok(())
    }
}

impl std::error::Error for TelemetryError {}

/// Unified error returned by every reliability policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReliabilityError<E> {
    /// The operation outlived its deadline.
    Timeout { elapsed: Duration, limit: Duration },
    /// The circuit is open; the operation was not invoked.
    CircuitOpen { failures: usize, retry_in: Duration },
    /// The fixed-window limit for this key is spent.
    RateLimited { retry_after: Duration },
    /// Bulkhead concurrency and waiter queue are both full.
    Capacity { in_flight: usize, max: usize },
    /// Every allowed attempt failed.
    RetryExhausted { attempts: usize, failures: Vec<E> },
    /// The caller's cancellation fired mid-operation.
    Canceled,
    /// The owning component is shutting down.
    Shutdown,
    /// The wrapped operation itself failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for ReliabilityError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { elapsed, limit } => {
                write!(f, "operation timed out after {elapsed:?} (limit {limit:?})")
            }
            Self::CircuitOpen { failures, retry_in } => {
                write!(f, "circuit open after {failures} failures, retry in {retry_in:?}")
            }
            Self::RateLimited { retry_after } => {
                write!(f, "rate limited, retry after {retry_after:?}")
            }
            Self::Capacity { in_flight, max } => {
                write!(f, "capacity exceeded ({in_flight} in flight, max {max})")
            }
            Self::RetryExhausted { attempts, failures } => {
                let last = failures.last().map(|e| e.to_string()).unwrap_or_default();
                write!(f, "retries exhausted after {attempts} attempts, last error: {last}")
            }
            Self::Canceled => write!(f, "operation canceled"),
            Self::Shutdown => write!(f, "reliability layer shut down"),
            Self::Inner(e) => write!(f, "{e}"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ReliabilityError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RetryExhausted { failures, .. } => {
                failures.last().map(|e| e as &dyn std::error::Error)
            }
            _ => None,
        }
    }
}

impl<E> ReliabilityError<E> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::Capacity { .. })
    }

    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. })
    }

    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }

    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    /// How long the caller should wait before trying again, when the error
    /// carries that information.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => Some(*retry_after),
            Self::CircuitOpen { retry_in, .. } => Some(*retry_in),
            _ => None,
        }
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// All recorded attempt failures, when retries were exhausted.
    pub fn failures(&self) -> Option<&[E]> {
        match self {
            Self::RetryExhausted { failures, .. } => Some(failures.as_slice()),
            _ => None,
        }
    }
}
