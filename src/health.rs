//! Named health probes, parallel execution, and rollup.
//!
//! Probes run concurrently, each boxed by its own timeout; a probe that
//! times out is unhealthy, full stop. Required probes drive the overall
//! status; optional probes can drag it down to degraded at worst.

use crate::error::TelemetryError;
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::watch;

/// Probe verdicts, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        };
        f.write_str(name)
    }
}

/// What a probe reports about its subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeReport {
    pub status: HealthStatus,
    pub message: Option<String>,
}

impl ProbeReport {
    pub fn healthy() -> Self {
        Self { status: HealthStatus::Healthy, message: None }
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self { status: HealthStatus::Degraded, message: Some(message.into()) }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self { status: HealthStatus::Unhealthy, message: Some(message.into()) }
    }
}

/// A named health check supplied by the embedder or the manager.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self) -> Result<ProbeReport, TelemetryError>;
}

/// Adapter turning a plain closure into a probe.
pub struct FnProbe<F>(F);

impl<F> FnProbe<F>
where
    F: Fn() -> Result<ProbeReport, TelemetryError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> HealthProbe for FnProbe<F>
where
    F: Fn() -> Result<ProbeReport, TelemetryError> + Send + Sync,
{
    async fn check(&self) -> Result<ProbeReport, TelemetryError> {
        (self.0)()
    }
}

/// Outcome of one probe run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResult {
    pub name: String,
    pub status: HealthStatus,
    pub message: Option<String>,
    pub latency: Duration,
    pub checked_at: SystemTime,
}

/// Rollup across all registered probes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealth {
    pub overall: HealthStatus,
    pub checks: BTreeMap<String, HealthResult>,
    pub checked_at: SystemTime,
}

/// Checker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Periodic re-run cadence.
    pub interval: Duration,
    /// Default per-probe timeout.
    pub probe_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self { interval: Duration::from_secs(60), probe_timeout: Duration::from_secs(5) }
    }
}

struct ProbeEntry {
    probe: Arc<dyn HealthProbe>,
    timeout: Duration,
    required: bool,
}

/// Registry plus runner for health probes.
pub struct HealthChecker {
    config: HealthConfig,
    probes: Mutex<HashMap<String, ProbeEntry>>,
    cached: ArcSwapOption<SystemHealth>,
    shutdown: watch::Sender<bool>,
}

impl HealthChecker {
    pub fn new(config: HealthConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            probes: Mutex::new(HashMap::new()),
            cached: ArcSwapOption::empty(),
            shutdown,
        }
    }

    /// Register a probe under `name`. A probe marked `required` drives the
    /// overall status; optional probes degrade it at most.
    pub fn register(
        &self,
        name: impl Into<String>,
        probe: Arc<dyn HealthProbe>,
        required: bool,
    ) {
        self.register_with_timeout(name, probe, required, self.config.probe_timeout);
    }

    pub fn register_with_timeout(
        &self,
        name: impl Into<String>,
        probe: Arc<dyn HealthProbe>,
        required: bool,
        timeout: Duration,
    ) {
        self.probes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(name.into(), ProbeEntry { probe, timeout, required });
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.probes.lock().unwrap_or_else(|p| p.into_inner()).remove(name).is_some()
    }

    /// Run every probe in parallel and roll the results up.
    pub async fn run_all(&self) -> SystemHealth {
        let entries: Vec<(String, Arc<dyn HealthProbe>, Duration, bool)> = {
            let probes = self.probes.lock().unwrap_or_else(|p| p.into_inner());
            probes
                .iter()
                .map(|(name, e)| (name.clone(), e.probe.clone(), e.timeout, e.required))
                .collect()
        };

        let runs = entries.into_iter().map(|(name, probe, timeout, required)| async move {
            let result = Self::run_probe(&name, probe.as_ref(), timeout).await;
            (result, required)
        });
        let outcomes = futures::future::join_all(runs).await;

        let mut overall = HealthStatus::Healthy;
        let mut checks = BTreeMap::new();
        for (result, required) in outcomes {
            if required {
                overall = overall.max(result.status);
            } else if result.status != HealthStatus::Healthy {
                overall = overall.max(HealthStatus::Degraded);
            }
            checks.insert(result.name.clone(), result);
        }

        let health = SystemHealth { overall, checks, checked_at: SystemTime::now() };
        self.cached.store(Some(Arc::new(health.clone())));
        health
    }

    /// Run a single registered probe.
    pub async fn run_one(&self, name: &str) -> Option<HealthResult> {
        let (probe, timeout) = {
            let probes = self.probes.lock().unwrap_or_else(|p| p.into_inner());
            let entry = probes.get(name)?;
            (entry.probe.clone(), entry.timeout)
        };
        Some(Self::run_probe(name, probe.as_ref(), timeout).await)
    }

    async fn run_probe(name: &str, probe: &dyn HealthProbe, timeout: Duration) -> HealthResult {
        let started = Instant::now();
        let (status, message) = match tokio::time::timeout(timeout, probe.check()).await {
            Ok(Ok(report)) => (report.status, report.message),
            Ok(Err(err)) => (HealthStatus::Unhealthy, Some(err.to_string())),
            Err(_) => (
                HealthStatus::Unhealthy,
                Some(format!("probe timed out after {timeout:?}")),
            ),
        };
        if status != HealthStatus::Healthy {
            tracing::warn!(probe = name, status = %status, "health probe not healthy");
        }
        HealthResult {
            name: name.to_string(),
            status,
            message,
            latency: started.elapsed(),
            checked_at: SystemTime::now(),
        }
    }

    /// Spawn the periodic runner; results land in the cache.
    pub fn start_periodic(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let checker = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(checker.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {}
                }
                let health = checker.run_all().await;
                tracing::debug!(overall = %health.overall, "periodic health check");
            }
            tracing::debug!("health checker stopped");
        })
    }

    /// Signal the periodic runner to exit.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Latest rollup, lock-free. `None` until the first run completes.
    pub fn cached(&self) -> Option<Arc<SystemHealth>> {
        self.cached.load_full()
    }
}
