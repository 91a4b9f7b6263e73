//! Rule-driven alerting over reliability metrics.
//!
//! Rules are evaluated on the caller's thread against a context snapshot;
//! matching rules build an [`Alert`] and dispatch it to their channels on a
//! bounded worker pool. Every sink call is boxed by a timeout, and a failing
//! sink is reported rather than allowed to block its siblings.

use crate::circuit_breaker::CircuitState;
use crate::clock::{Clock, MonotonicClock};
use crate::error::{ErrorCategory, Severity, TelemetryError};
use crate::rate_limit::RateLimiterStats;
use crate::resource_monitor::{ResourceKind, ResourceSample};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::Semaphore;
use uuid::Uuid;

/// Transport family a channel belongs to. The actual transport is the
/// caller-supplied [`AlertSink`]; the kind only labels it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Slack,
    Pagerduty,
    Email,
    Webhook,
    Custom,
}

/// A named alert destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertChannel {
    pub name: String,
    pub kind: ChannelKind,
    /// Opaque sink configuration (tokens, URLs); the layer never reads it.
    pub config: serde_json::Value,
    /// Severities this channel accepts. Empty means all.
    pub severity_filter: BTreeSet<Severity>,
    pub enabled: bool,
}

impl AlertChannel {
    pub fn new(name: impl Into<String>, kind: ChannelKind) -> Self {
        Self {
            name: name.into(),
            kind,
            config: serde_json::Value::Null,
            severity_filter: BTreeSet::new(),
            enabled: true,
        }
    }

    pub fn with_severity_filter(mut self, severities: impl IntoIterator<Item = Severity>) -> Self {
        self.severity_filter = severities.into_iter().collect();
        self
    }

    fn accepts(&self, severity: Severity) -> bool {
        self.enabled && (self.severity_filter.is_empty() || self.severity_filter.contains(&severity))
    }
}

/// A fired alert, as handed to sinks and kept in history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub rule_id: String,
    pub title: String,
    pub message: String,
    pub severity: Severity,
    pub fired_at: SystemTime,
    pub data: serde_json::Value,
    pub channels_dispatched: Vec<String>,
}

/// Predicate a rule evaluates against the context snapshot.
pub enum AlertCondition {
    /// At least `threshold` errors inside `window`, optionally filtered by
    /// severity.
    ErrorCount {
        threshold: usize,
        window: Duration,
        severity_filter: Option<BTreeSet<Severity>>,
    },
    /// Error arrival rate over `window`, in errors per second.
    ErrorRate { per_second: f64, window: Duration },
    /// At least `open_count` circuits currently open.
    CircuitBreaker { open_count: usize },
    /// Latest resource sample at or above `threshold` for `kind`.
    Resource { kind: ResourceKind, threshold: f64 },
    /// Caller-supplied predicate over the whole context.
    Custom(Arc<dyn Fn(&AlertContext) -> bool + Send + Sync>),
}

impl std::fmt::Debug for AlertCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ErrorCount { threshold, window, .. } => f
                .debug_struct("ErrorCount")
                .field("threshold", threshold)
                .field("window", window)
                .finish(),
            Self::ErrorRate { per_second, window } => f
                .debug_struct("ErrorRate")
                .field("per_second", per_second)
                .field("window", window)
                .finish(),
            Self::CircuitBreaker { open_count } => {
                f.debug_struct("CircuitBreaker").field("open_count", open_count).finish()
            }
            Self::Resource { kind, threshold } => f
                .debug_struct("Resource")
                .field("kind", kind)
                .field("threshold", threshold)
                .finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// A rule binding a condition to channels, throttled by a cooldown.
#[derive(Debug)]
pub struct AlertRule {
    pub id: String,
    pub name: String,
    pub condition: AlertCondition,
    pub channels: Vec<String>,
    pub cooldown: Duration,
    /// Explicit severity; derived from the context when absent.
    pub severity: Option<Severity>,
}

/// Snapshot the manager assembles for rule evaluation.
#[derive(Clone, Default)]
pub struct AlertContext {
    /// Recent errors, newest last.
    pub errors: Vec<TelemetryError>,
    pub circuits: BTreeMap<String, CircuitState>,
    pub rate_limiter: RateLimiterStats,
    pub resources: Option<Arc<ResourceSample>>,
    pub custom_metrics: BTreeMap<String, f64>,
}

impl AlertContext {
    pub fn open_circuits(&self) -> usize {
        self.circuits.values().filter(|s| **s == CircuitState::Open).count()
    }

    fn errors_within(&self, window: Duration) -> impl Iterator<Item = &TelemetryError> {
        let cutoff = SystemTime::now().checked_sub(window);
        self.errors.iter().filter(move |e| match cutoff {
            Some(cutoff) => e.timestamp >= cutoff,
            None => true,
        })
    }
}

/// Destination transport implemented by the embedder. Retries are the
/// sink's own responsibility.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn deliver(&self, alert: &Alert) -> Result<(), TelemetryError>;
}

/// Sink that logs alerts through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl AlertSink for LogSink {
    async fn deliver(&self, alert: &Alert) -> Result<(), TelemetryError> {
        tracing::warn!(
            rule = %alert.rule_id,
            severity = %alert.severity,
            title = %alert.title,
            "alert fired"
        );
        Ok(())
    }
}

/// Bounded in-memory sink for tests and local inspection.
#[derive(Debug, Clone)]
pub struct MemorySink {
    alerts: Arc<Mutex<VecDeque<Alert>>>,
    capacity: usize,
}

impl MemorySink {
    pub fn new(capacity: usize) -> Self {
        Self { alerts: Arc::new(Mutex::new(VecDeque::new())), capacity: capacity.max(1) }
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().unwrap_or_else(|p| p.into_inner()).iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.alerts.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AlertSink for MemorySink {
    async fn deliver(&self, alert: &Alert) -> Result<(), TelemetryError> {
        let mut alerts = self.alerts.lock().unwrap_or_else(|p| p.into_inner());
        alerts.push_back(alert.clone());
        while alerts.len() > self.capacity {
            alerts.pop_front();
        }
        Ok(())
    }
}

/// Service tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertingConfig {
    /// Per-sink delivery timeout.
    pub dispatch_timeout: Duration,
    /// Concurrent deliveries across all sinks.
    pub max_concurrent_dispatch: usize,
    /// Alert history ring size.
    pub history: usize,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            dispatch_timeout: Duration::from_secs(5),
            max_concurrent_dispatch: 4,
            history: 1_000,
        }
    }
}

type SinkErrorHook = Arc<dyn Fn(TelemetryError) + Send + Sync>;
type FiredHook = Arc<dyn Fn(&str, &Alert) + Send + Sync>;

/// Rule engine plus dispatcher.
pub struct AlertingService {
    config: AlertingConfig,
    channels: Mutex<HashMap<String, (AlertChannel, Arc<dyn AlertSink>)>>,
    rules: Mutex<Vec<AlertRule>>,
    last_fired: Mutex<HashMap<String, u64>>,
    history: Mutex<VecDeque<Alert>>,
    dispatch_pool: Arc<Semaphore>,
    clock: Arc<dyn Clock>,
    on_sink_error: Option<SinkErrorHook>,
    on_fired: Option<FiredHook>,
}

impl AlertingService {
    pub fn new(config: AlertingConfig) -> Self {
        Self::with_clock(config, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(config: AlertingConfig, clock: Arc<dyn Clock>) -> Self {
        let permits = config.max_concurrent_dispatch.max(1);
        Self {
            config,
            channels: Mutex::new(HashMap::new()),
            rules: Mutex::new(Vec::new()),
            last_fired: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            dispatch_pool: Arc::new(Semaphore::new(permits)),
            clock,
            on_sink_error: None,
            on_fired: None,
        }
    }

    /// Report failed sink deliveries (wired to the error handler by the
    /// manager).
    pub fn with_sink_error_hook(
        mut self,
        hook: impl Fn(TelemetryError) + Send + Sync + 'static,
    ) -> Self {
        self.on_sink_error = Some(Arc::new(hook));
        self
    }

    /// Observe fired alerts (wired to the event bus by the manager).
    pub fn with_fired_hook(
        mut self,
        hook: impl Fn(&str, &Alert) + Send + Sync + 'static,
    ) -> Self {
        self.on_fired = Some(Arc::new(hook));
        self
    }

    pub fn add_channel(&self, channel: AlertChannel, sink: Arc<dyn AlertSink>) {
        self.channels
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(channel.name.clone(), (channel, sink));
    }

    pub fn add_rule(&self, rule: AlertRule) {
        self.rules.lock().unwrap_or_else(|p| p.into_inner()).push(rule);
    }

    pub fn remove_rule(&self, id: &str) -> bool {
        let mut rules = self.rules.lock().unwrap_or_else(|p| p.into_inner());
        let before = rules.len();
        rules.retain(|r| r.id != id);
        rules.len() != before
    }

    /// Evaluate every rule against `ctx`, dispatching matches. Returns the
    /// alerts fired in this pass. Must run inside a tokio runtime.
    pub fn check(&self, ctx: &AlertContext) -> Vec<Alert> {
        let now = self.clock.now_millis();
        let mut fired = Vec::new();

        let rules = self.rules.lock().unwrap_or_else(|p| p.into_inner());
        for rule in rules.iter() {
            {
                let last = self.last_fired.lock().unwrap_or_else(|p| p.into_inner());
                if let Some(&at) = last.get(&rule.id) {
                    if now.saturating_sub(at) < rule.cooldown.as_millis() as u64 {
                        continue;
                    }
                }
            }

            if !Self::evaluate(&rule.condition, ctx) {
                continue;
            }

            let severity = rule.severity.unwrap_or_else(|| Self::derive_severity(rule, ctx));
            let alert = self.build_alert(rule, ctx, severity);

            self.last_fired
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .insert(rule.id.clone(), now);
            {
                let mut history = self.history.lock().unwrap_or_else(|p| p.into_inner());
                history.push_back(alert.clone());
                while history.len() > self.config.history {
                    history.pop_front();
                }
            }

            if let Some(hook) = &self.on_fired {
                hook(&rule.name, &alert);
            }
            self.dispatch(&alert);
            fired.push(alert);
        }
        fired
    }

    fn evaluate(condition: &AlertCondition, ctx: &AlertContext) -> bool {
        match condition {
            AlertCondition::ErrorCount { threshold, window, severity_filter } => {
                let count = ctx
                    .errors_within(*window)
                    .filter(|e| match severity_filter {
                        Some(filter) => filter.contains(&e.severity),
                        None => true,
                    })
                    .count();
                count >= *threshold
            }
            AlertCondition::ErrorRate { per_second, window } => {
                let count = ctx.errors_within(*window).count();
                let secs = window.as_secs_f64();
                secs > 0.0 && count as f64 / secs >= *per_second
            }
            AlertCondition::CircuitBreaker { open_count } => ctx.open_circuits() >= *open_count,
            AlertCondition::Resource { kind, threshold } => match &ctx.resources {
                Some(sample) => {
                    let value = match kind {
                        ResourceKind::Cpu => sample.cpu_percent,
                        ResourceKind::Memory => sample.memory_percent(),
                        ResourceKind::SchedulerLag => {
                            sample.scheduler_lag.as_secs_f64() * 1_000.0
                        }
                        ResourceKind::Gc => match sample.gc_per_minute {
                            Some(gc) => gc as f64,
                            None => return false,
                        },
                    };
                    value >= *threshold
                }
                None => false,
            },
            AlertCondition::Custom(eval) => eval(ctx),
        }
    }

    fn derive_severity(rule: &AlertRule, ctx: &AlertContext) -> Severity {
        match &rule.condition {
            AlertCondition::ErrorCount { window, .. }
            | AlertCondition::ErrorRate { window, .. } => {
                let mut high = 0usize;
                for err in ctx.errors_within(*window) {
                    match err.severity {
                        Severity::Critical => return Severity::Critical,
                        Severity::High => high += 1,
                        _ => {}
                    }
                }
                if high > 5 {
                    Severity::High
                } else {
                    Severity::Medium
                }
            }
            AlertCondition::CircuitBreaker { .. } => {
                let open = ctx.open_circuits();
                if open > 5 {
                    Severity::Critical
                } else if open > 2 {
                    Severity::High
                } else {
                    Severity::Medium
                }
            }
            AlertCondition::Resource { .. } | AlertCondition::Custom(_) => Severity::Medium,
        }
    }

    fn build_alert(&self, rule: &AlertRule, ctx: &AlertContext, severity: Severity) -> Alert {
        let channels = self.channels.lock().unwrap_or_else(|p| p.into_inner());
        let dispatched: Vec<String> = rule
            .channels
            .iter()
            .filter(|name| {
                channels
                    .get(name.as_str())
                    .map(|(channel, _)| channel.accepts(severity))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();

        Alert {
            id: Uuid::new_v4(),
            rule_id: rule.id.clone(),
            title: rule.name.clone(),
            message: format!(
                "rule '{}' matched: {:?} ({} recent errors, {} open circuits)",
                rule.name,
                rule.condition,
                ctx.errors.len(),
                ctx.open_circuits()
            ),
            severity,
            fired_at: SystemTime::now(),
            data: serde_json::json!({
                "open_circuits": ctx.open_circuits(),
                "recent_errors": ctx.errors.len(),
                "rate_limiter_denied": ctx.rate_limiter.total_denied,
            }),
            channels_dispatched: dispatched,
        }
    }

    /// Deliver to each channel on the bounded pool, best-effort.
    fn dispatch(&self, alert: &Alert) {
        let sinks: Vec<(String, Arc<dyn AlertSink>)> = {
            let channels = self.channels.lock().unwrap_or_else(|p| p.into_inner());
            alert
                .channels_dispatched
                .iter()
                .filter_map(|name| {
                    channels.get(name.as_str()).map(|(_, sink)| (name.clone(), sink.clone()))
                })
                .collect()
        };

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("no runtime available, dropping alert dispatch");
            return;
        };
        for (name, sink) in sinks {
            let alert = alert.clone();
            let pool = self.dispatch_pool.clone();
            let timeout = self.config.dispatch_timeout;
            let on_error = self.on_sink_error.clone();
            runtime.spawn(async move {
                let _permit = match pool.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                let outcome = tokio::time::timeout(timeout, sink.deliver(&alert)).await;
                let failure = match outcome {
                    Ok(Ok(())) => None,
                    Ok(Err(err)) => Some(format!("sink '{name}' failed: {err}")),
                    Err(_) => Some(format!("sink '{name}' timed out after {timeout:?}")),
                };
                if let Some(message) = failure {
                    tracing::warn!(sink = %name, "alert delivery failed");
                    if let Some(hook) = &on_error {
                        hook(
                            TelemetryError::new(message, ErrorCategory::System, Severity::Low)
                                .with_context("alert_id", alert.id.to_string()),
                        );
                    }
                }
            });
        }
    }

    /// Alerts fired inside `window`, oldest first. `None` returns all
    /// retained history.
    pub fn history(&self, window: Option<Duration>) -> Vec<Alert> {
        let cutoff = window.and_then(|w| SystemTime::now().checked_sub(w));
        let history = self.history.lock().unwrap_or_else(|p| p.into_inner());
        history
            .iter()
            .filter(|alert| match cutoff {
                Some(cutoff) => alert.fired_at >= cutoff,
                None => true,
            })
            .cloned()
            .collect()
    }
}
