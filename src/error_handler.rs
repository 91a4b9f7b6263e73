//! Error intake: classification, deduplication, buffering, and thresholds.
//!
//! One lock guards the ring buffer, dedup table, and counters. Threshold and
//! critical callbacks run outside that lock, on the runtime when one is
//! available, so user code can never deadlock the handler.

use crate::clock::{Clock, MonotonicClock};
use crate::error::{ErrorCategory, Severity, TelemetryError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Tuning for the error handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorHandlerConfig {
    /// Ring buffer capacity; oldest records are evicted first.
    pub buffer_size: usize,
    /// Window over which severity thresholds are evaluated.
    pub window: Duration,
    /// High-severity count that trips the threshold callback.
    pub high_threshold: usize,
    /// Critical-severity count that trips the threshold callback.
    pub critical_threshold: usize,
    /// Identical errors inside this window collapse into one record.
    pub dedup_window: Duration,
}

impl Default for ErrorHandlerConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1_000,
            window: Duration::from_secs(300),
            high_threshold: 10,
            critical_threshold: 1,
            dedup_window: Duration::from_secs(10),
        }
    }
}

/// Aggregate counters reported by [`ErrorHandler::stats`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorStats {
    pub total: u64,
    pub by_severity: BTreeMap<Severity, u64>,
    pub by_category: BTreeMap<ErrorCategory, u64>,
    /// Distinct records inside the configured window.
    pub recent: usize,
    /// Records collapsed by deduplication since startup.
    pub deduplicated: u64,
}

type ThresholdCallback = Arc<dyn Fn(Vec<TelemetryError>, Severity) + Send + Sync>;
type CriticalCallback = Arc<dyn Fn(TelemetryError) + Send + Sync>;

struct DedupEntry {
    count: u64,
    last_seen: u64,
}

struct State {
    buffer: VecDeque<(u64, TelemetryError)>,
    dedup: HashMap<(ErrorCategory, Severity, String), DedupEntry>,
    /// Arrival stamps per severity, duplicates included; this is the count
    /// thresholds are evaluated against.
    occurrences: BTreeMap<Severity, VecDeque<u64>>,
    by_severity: BTreeMap<Severity, u64>,
    by_category: BTreeMap<ErrorCategory, u64>,
    total: u64,
    deduplicated: u64,
}

/// Classifies, deduplicates, and buffers telemetry errors.
pub struct ErrorHandler {
    config: ErrorHandlerConfig,
    state: Mutex<State>,
    threshold_callbacks: Mutex<Vec<ThresholdCallback>>,
    critical_callbacks: Mutex<Vec<CriticalCallback>>,
    clock: Arc<dyn Clock>,
}

impl ErrorHandler {
    pub fn new(config: ErrorHandlerConfig) -> Self {
        Self::with_clock(config, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(config: ErrorHandlerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            state: Mutex::new(State {
                buffer: VecDeque::new(),
                dedup: HashMap::new(),
                occurrences: BTreeMap::new(),
                by_severity: BTreeMap::new(),
                by_category: BTreeMap::new(),
                total: 0,
                deduplicated: 0,
            }),
            threshold_callbacks: Mutex::new(Vec::new()),
            critical_callbacks: Mutex::new(Vec::new()),
            clock,
        }
    }

    /// Build a classified error. Thin wrapper kept so call sites read like
    /// the operation they perform.
    pub fn create_error(
        &self,
        message: impl Into<String>,
        category: ErrorCategory,
        severity: Severity,
    ) -> TelemetryError {
        TelemetryError::new(message, category, severity)
    }

    /// Register a callback fired when a severity count crosses its threshold
    /// inside the window. Receives the windowed batch for that severity.
    pub fn on_threshold(&self, callback: impl Fn(Vec<TelemetryError>, Severity) + Send + Sync + 'static) {
        self.threshold_callbacks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(Arc::new(callback));
    }

    /// Register a callback fired once per critical error.
    pub fn on_critical(&self, callback: impl Fn(TelemetryError) + Send + Sync + 'static) {
        self.critical_callbacks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(Arc::new(callback));
    }

    /// Classify a raw error and run it through [`handle`](Self::handle).
    pub fn handle_raw(&self, raw: &(dyn std::error::Error + 'static)) -> TelemetryError {
        let err = TelemetryError::classify(raw);
        self.handle(err.clone());
        err
    }

    /// Record a classified error: dedup, buffer, count, and fire callbacks.
    ///
    /// Deduplication suppresses only buffer growth. Counters, threshold
    /// evaluation, and the critical callback see every occurrence.
    pub fn handle(&self, err: TelemetryError) {
        let now = self.clock.now_millis();
        let window_millis = self.config.window.as_millis() as u64;
        let dedup_millis = self.config.dedup_window.as_millis() as u64;

        let mut fire_threshold: Option<(Vec<TelemetryError>, Severity)> = None;
        {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());

            state.total += 1;
            *state.by_severity.entry(err.severity).or_insert(0) += 1;
            *state.by_category.entry(err.category).or_insert(0) += 1;

            let threshold = match err.severity {
                Severity::High => Some(self.config.high_threshold),
                Severity::Critical => Some(self.config.critical_threshold),
                _ => None,
            };
            // The stamp log counts duplicates too; the buffer does not.
            // Edge-triggered: fire on the occurrence that reaches the
            // threshold, not on every one past it.
            let crossed = {
                let stamp_cap = self.config.buffer_size;
                let stamps = state.occurrences.entry(err.severity).or_default();
                while stamps
                    .front()
                    .map_or(false, |at| now.saturating_sub(*at) > window_millis)
                {
                    stamps.pop_front();
                }
                let before = stamps.len();
                if before < stamp_cap {
                    stamps.push_back(now);
                }
                match threshold {
                    Some(threshold) => before < threshold && stamps.len() >= threshold,
                    None => false,
                }
            };

            let key = err.dedup_key();
            let mut duplicate = false;
            if let Some(entry) = state.dedup.get_mut(&key) {
                if now.saturating_sub(entry.last_seen) <= dedup_millis {
                    entry.count += 1;
                    entry.last_seen = now;
                    duplicate = true;
                }
            }
            if duplicate {
                state.deduplicated += 1;
            } else {
                state.dedup.insert(key, DedupEntry { count: 1, last_seen: now });
                state.dedup.retain(|_, e| now.saturating_sub(e.last_seen) <= dedup_millis);

                state.buffer.push_back((now, err.clone()));
                while state.buffer.len() > self.config.buffer_size {
                    state.buffer.pop_front();
                }
            }

            if crossed {
                // Batch of windowed representatives; duplicates collapse
                // into their first record here, the count above does not.
                let windowed: Vec<TelemetryError> = state
                    .buffer
                    .iter()
                    .filter(|(at, e)| {
                        now.saturating_sub(*at) <= window_millis && e.severity == err.severity
                    })
                    .map(|(_, e)| e.clone())
                    .collect();
                fire_threshold = Some((windowed, err.severity));
            }
        }

        if let Some((batch, severity)) = fire_threshold {
            tracing::warn!(
                severity = %severity,
                count = batch.len(),
                "error threshold crossed"
            );
            let callbacks = self
                .threshold_callbacks
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .clone();
            for cb in callbacks {
                let batch = batch.clone();
                dispatch(move || cb(batch, severity));
            }
        }

        if err.severity == Severity::Critical {
            tracing::error!(error = %err, "critical telemetry error");
            let callbacks = self
                .critical_callbacks
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .clone();
            for cb in callbacks {
                let err = err.clone();
                dispatch(move || cb(err));
            }
        }
    }

    /// Retryable iff the error says so, its category is transient, and it
    /// was not produced by an open circuit.
    pub fn is_retryable(&self, err: &TelemetryError) -> bool {
        err.retryable
            && err.category.transient()
            && err.context.get("circuit_state").map(String::as_str) != Some("open")
    }

    pub fn stats(&self) -> ErrorStats {
        let now = self.clock.now_millis();
        let window_millis = self.config.window.as_millis() as u64;
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        ErrorStats {
            total: state.total,
            by_severity: state.by_severity.clone(),
            by_category: state.by_category.clone(),
            recent: state
                .buffer
                .iter()
                .filter(|(at, _)| now.saturating_sub(*at) <= window_millis)
                .count(),
            deduplicated: state.deduplicated,
        }
    }

    /// Records inside `window`, newest last.
    pub fn recent_errors(&self, window: Duration) -> Vec<TelemetryError> {
        let now = self.clock.now_millis();
        let window_millis = window.as_millis() as u64;
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state
            .buffer
            .iter()
            .filter(|(at, _)| now.saturating_sub(*at) <= window_millis)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Number of buffered records. Never exceeds `buffer_size`.
    pub fn buffered(&self) -> usize {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).buffer.len()
    }
}

/// Run user code off the handler's lock: on the runtime when present,
/// inline otherwise (tests without a runtime).
fn dispatch(f: impl FnOnce() + Send + 'static) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move { f() });
        }
        Err(_) => f(),
    }
}
