//! Periodic host and runtime resource sampling with threshold alerts.
//!
//! A dedicated worker samples process CPU, memory, load, and scheduler lag
//! every interval. Scheduler lag is measured by timing a zero-delay timer
//! continuation, so a congested runtime shows up directly. Warning alerts
//! are edge-triggered (a sample must come from below the threshold);
//! critical alerts fire on every sample in the critical band.

use crate::error::Severity;
use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::watch;

/// Metrics that carry warning/critical thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Cpu,
    Memory,
    SchedulerLag,
    Gc,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResourceKind::Cpu => "cpu",
            ResourceKind::Memory => "memory",
            ResourceKind::SchedulerLag => "scheduler_lag",
            ResourceKind::Gc => "gc",
        };
        f.write_str(name)
    }
}

/// Warning/critical pair for one metric.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ThresholdPair {
    pub warning: f64,
    pub critical: f64,
}

/// Per-metric thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceThresholds {
    /// Process CPU percent.
    pub cpu_percent: ThresholdPair,
    /// System memory used, percent of total.
    pub memory_percent: ThresholdPair,
    /// Timer continuation delay, milliseconds.
    pub scheduler_lag_ms: ThresholdPair,
    /// Collections per minute, evaluated only when a GC signal is installed.
    pub gc_per_minute: ThresholdPair,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self {
            cpu_percent: ThresholdPair { warning: 70.0, critical: 90.0 },
            memory_percent: ThresholdPair { warning: 70.0, critical: 85.0 },
            scheduler_lag_ms: ThresholdPair { warning: 100.0, critical: 250.0 },
            gc_per_minute: ThresholdPair { warning: 10.0, critical: 20.0 },
        }
    }
}

/// Monitor tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceMonitorConfig {
    pub interval: Duration,
    pub thresholds: ResourceThresholds,
    /// Ring-buffered sample history.
    pub history: usize,
}

impl Default for ResourceMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            thresholds: ResourceThresholds::default(),
            history: 1_000,
        }
    }
}

/// One sampling pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSample {
    pub sampled_at: SystemTime,
    /// Process CPU percent, delta-based across refreshes.
    pub cpu_percent: f64,
    /// Whole-machine CPU percent.
    pub cpu_global_percent: f64,
    pub rss_bytes: u64,
    pub virtual_bytes: u64,
    /// Observed zero-delay timer continuation gap.
    pub scheduler_lag: Duration,
    /// Present only when a [`GcSignal`] is installed; never fabricated.
    pub gc_per_minute: Option<u32>,
    pub load_avg: [f64; 3],
    pub free_memory_bytes: u64,
    pub total_memory_bytes: u64,
}

impl ResourceSample {
    /// System memory in use, percent of total. Zero-total guards against
    /// platforms that report nothing.
    pub fn memory_percent(&self) -> f64 {
        if self.total_memory_bytes == 0 {
            return 0.0;
        }
        let used = self.total_memory_bytes.saturating_sub(self.free_memory_bytes);
        used as f64 / self.total_memory_bytes as f64 * 100.0
    }
}

/// Aggregate over a trailing window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceAggregate {
    pub samples: usize,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub scheduler_lag: Duration,
}

/// Optional source for collection counts (e.g. an instrumented allocator).
/// Absent a signal the GC field stays `None`.
pub trait GcSignal: Send + Sync {
    fn collections_last_minute(&self) -> Option<u32>;
}

type AlertHook = Arc<dyn Fn(ResourceKind, Severity, f64, f64) + Send + Sync>;

struct MonitorShared {
    config: ResourceMonitorConfig,
    latest: ArcSwapOption<ResourceSample>,
    history: Mutex<VecDeque<ResourceSample>>,
    warned: Mutex<HashMap<ResourceKind, bool>>,
    gc_signal: Option<Arc<dyn GcSignal>>,
    on_alert: Option<AlertHook>,
}

/// Periodic CPU/memory/scheduler sampler.
#[derive(Clone)]
pub struct ResourceMonitor {
    shared: Arc<MonitorShared>,
    shutdown: watch::Sender<bool>,
}

impl ResourceMonitor {
    pub fn new(config: ResourceMonitorConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(MonitorShared {
                config,
                latest: ArcSwapOption::empty(),
                history: Mutex::new(VecDeque::new()),
                warned: Mutex::new(HashMap::new()),
                gc_signal: None,
                on_alert: None,
            }),
            shutdown,
        }
    }

    /// Install a GC signal before starting the sampler.
    pub fn with_gc_signal(mut self, signal: Arc<dyn GcSignal>) -> Self {
        let shared = Arc::get_mut(&mut self.shared);
        if let Some(shared) = shared {
            shared.gc_signal = Some(signal);
        }
        self
    }

    /// Observe threshold crossings. The hook runs on the sampler task and
    /// must not block.
    pub fn with_alert_hook(
        mut self,
        hook: impl Fn(ResourceKind, Severity, f64, f64) + Send + Sync + 'static,
    ) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.on_alert = Some(Arc::new(hook));
        }
        self
    }

    /// Spawn the sampler worker. Stop it with [`stop`](Self::stop).
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let shared = self.shared.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut sys = sysinfo::System::new();
            let pid = sysinfo::get_current_pid().ok();
            // Prime the CPU counters so the first real sample has a delta.
            sys.refresh_cpu();
            let mut ticker = tokio::time::interval(shared.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {}
                }

                let probe_started = Instant::now();
                tokio::time::sleep(Duration::ZERO).await;
                let scheduler_lag = probe_started.elapsed();

                sys.refresh_cpu();
                sys.refresh_memory();
                if let Some(pid) = pid {
                    sys.refresh_process(pid);
                }
                let (cpu_percent, rss_bytes, virtual_bytes) =
                    match pid.and_then(|pid| sys.process(pid)) {
                        Some(process) => (
                            process.cpu_usage() as f64,
                            process.memory(),
                            process.virtual_memory(),
                        ),
                        None => (0.0, 0, 0),
                    };

                let load = sysinfo::System::load_average();
                let sample = ResourceSample {
                    sampled_at: SystemTime::now(),
                    cpu_percent,
                    cpu_global_percent: sys.global_cpu_info().cpu_usage() as f64,
                    rss_bytes,
                    virtual_bytes,
                    scheduler_lag,
                    gc_per_minute: shared
                        .gc_signal
                        .as_ref()
                        .and_then(|signal| signal.collections_last_minute()),
                    load_avg: [load.one, load.five, load.fifteen],
                    free_memory_bytes: sys.available_memory(),
                    total_memory_bytes: sys.total_memory(),
                };
                Self::record_on(&shared, sample);
            }
            tracing::debug!("resource monitor stopped");
        })
    }

    /// Signal the sampler worker to exit.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Feed one sample through buffering and threshold evaluation. The
    /// sampler worker calls this; embedders with their own sampler may too.
    pub fn record(&self, sample: ResourceSample) {
        Self::record_on(&self.shared, sample);
    }

    fn record_on(shared: &MonitorShared, sample: ResourceSample) {
        Self::evaluate(shared, ResourceKind::Cpu, sample.cpu_percent);
        Self::evaluate(shared, ResourceKind::Memory, sample.memory_percent());
        Self::evaluate(
            shared,
            ResourceKind::SchedulerLag,
            sample.scheduler_lag.as_secs_f64() * 1_000.0,
        );
        if let Some(gc) = sample.gc_per_minute {
            Self::evaluate(shared, ResourceKind::Gc, gc as f64);
        }

        {
            let mut history = shared.history.lock().unwrap_or_else(|p| p.into_inner());
            history.push_back(sample.clone());
            while history.len() > shared.config.history {
                history.pop_front();
            }
        }
        shared.latest.store(Some(Arc::new(sample)));
    }

    fn evaluate(shared: &MonitorShared, kind: ResourceKind, value: f64) {
        let pair = match kind {
            ResourceKind::Cpu => shared.config.thresholds.cpu_percent,
            ResourceKind::Memory => shared.config.thresholds.memory_percent,
            ResourceKind::SchedulerLag => shared.config.thresholds.scheduler_lag_ms,
            ResourceKind::Gc => shared.config.thresholds.gc_per_minute,
        };

        let mut warned = shared.warned.lock().unwrap_or_else(|p| p.into_inner());
        let was_warning = warned.get(&kind).copied().unwrap_or(false);
        let is_warning = value >= pair.warning;
        warned.insert(kind, is_warning);
        drop(warned);

        if value >= pair.critical {
            tracing::error!(resource = %kind, value, threshold = pair.critical, "resource critical");
            if let Some(hook) = &shared.on_alert {
                hook(kind, Severity::Critical, value, pair.critical);
            }
        } else if is_warning && !was_warning {
            tracing::warn!(resource = %kind, value, threshold = pair.warning, "resource warning");
            if let Some(hook) = &shared.on_alert {
                hook(kind, Severity::High, value, pair.warning);
            }
        }
    }

    /// Most recent sample, lock-free.
    pub fn latest(&self) -> Option<Arc<ResourceSample>> {
        self.shared.latest.load_full()
    }

    /// Mean over samples newer than `window`.
    pub fn average(&self, window: Duration) -> ResourceAggregate {
        self.aggregate(window, |acc, n| acc / n as f64)
    }

    /// Maximum over samples newer than `window`.
    pub fn peak(&self, window: Duration) -> ResourceAggregate {
        let cutoff = SystemTime::now().checked_sub(window);
        let history = self.shared.history.lock().unwrap_or_else(|p| p.into_inner());
        let mut out = ResourceAggregate::default();
        for sample in history.iter() {
            if let Some(cutoff) = cutoff {
                if sample.sampled_at < cutoff {
                    continue;
                }
            }
            out.samples += 1;
            out.cpu_percent = out.cpu_percent.max(sample.cpu_percent);
            out.memory_percent = out.memory_percent.max(sample.memory_percent());
            out.scheduler_lag = out.scheduler_lag.max(sample.scheduler_lag);
        }
        out
    }

    fn aggregate(&self, window: Duration, finish: impl Fn(f64, usize) -> f64) -> ResourceAggregate {
        let cutoff = SystemTime::now().checked_sub(window);
        let history = self.shared.history.lock().unwrap_or_else(|p| p.into_inner());
        let mut cpu = 0.0;
        let mut memory = 0.0;
        let mut lag = Duration::ZERO;
        let mut samples = 0usize;
        for sample in history.iter() {
            if let Some(cutoff) = cutoff {
                if sample.sampled_at < cutoff {
                    continue;
                }
            }
            samples += 1;
            cpu += sample.cpu_percent;
            memory += sample.memory_percent();
            lag += sample.scheduler_lag;
        }
        if samples == 0 {
            return ResourceAggregate::default();
        }
        ResourceAggregate {
            samples,
            cpu_percent: finish(cpu, samples),
            memory_percent: finish(memory, samples),
            scheduler_lag: lag / samples as u32,
        }
    }

    pub fn history_len(&self) -> usize {
        self.shared.history.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}
