//! Per-key fixed-window rate limiting.
//!
//! Windows are created lazily on first check and swept once idle for twice
//! the window length. Checks on distinct keys contend only on the map lock;
//! the decision itself is a handful of integer operations.

use crate::clock::{Clock, MonotonicClock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Limiter tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Admissions per key per window.
    pub max_requests: u32,
    /// Fixed window length.
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { enabled: true, max_requests: 100, window: Duration::from_secs(60) }
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    /// Admitted; `remaining` permits are left in the current window.
    Allowed { remaining: u32 },
    /// Rejected; the window has `retry_after` left to run.
    Denied { retry_after: Duration },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Decision::Denied { retry_after } => Some(*retry_after),
            Decision::Allowed { .. } => None,
        }
    }
}

/// Counters reported by [`FixedWindowLimiter::stats`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimiterStats {
    pub active_keys: usize,
    pub total_checks: u64,
    pub total_denied: u64,
}

struct Window {
    started_at: u64,
    count: u32,
}

/// Fixed-window counter keyed by caller-chosen strings.
#[derive(Clone)]
pub struct FixedWindowLimiter {
    config: RateLimitConfig,
    windows: Arc<Mutex<HashMap<String, Window>>>,
    clock: Arc<dyn Clock>,
    total_checks: Arc<AtomicU64>,
    total_denied: Arc<AtomicU64>,
}

impl FixedWindowLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_clock(config, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            windows: Arc::new(Mutex::new(HashMap::new())),
            clock,
            total_checks: Arc::new(AtomicU64::new(0)),
            total_denied: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Check and consume one permit for `key`.
    pub fn check(&self, key: &str) -> Decision {
        if !self.config.enabled {
            return Decision::Allowed { remaining: self.config.max_requests };
        }

        self.total_checks.fetch_add(1, Ordering::Relaxed);
        let now = self.clock.now_millis();
        let window_millis = self.config.window.as_millis() as u64;

        let mut windows = self.windows.lock().unwrap_or_else(|p| p.into_inner());
        let window = windows
            .entry(key.to_string())
            .or_insert(Window { started_at: now, count: 0 });

        if now.saturating_sub(window.started_at) > window_millis {
            window.started_at = now;
            window.count = 0;
        }

        if window.count >= self.config.max_requests {
            self.total_denied.fetch_add(1, Ordering::Relaxed);
            let retry_after = (window.started_at + window_millis).saturating_sub(now);
            tracing::debug!(key, retry_after_ms = retry_after, "rate limit exceeded");
            return Decision::Denied { retry_after: Duration::from_millis(retry_after) };
        }

        window.count += 1;
        Decision::Allowed { remaining: self.config.max_requests - window.count }
    }

    /// Drop windows idle longer than twice the window length. Returns how
    /// many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_millis();
        let stale_after = 2 * self.config.window.as_millis() as u64;
        let mut windows = self.windows.lock().unwrap_or_else(|p| p.into_inner());
        let before = windows.len();
        windows.retain(|_, w| now.saturating_sub(w.started_at) <= stale_after);
        before - windows.len()
    }

    /// Background sweeper; the caller owns the handle and aborts it on
    /// shutdown.
    pub fn spawn_sweeper(&self, every: Duration) -> tokio::task::JoinHandle<()> {
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // First tick fires immediately; skip it so a fresh limiter is
            // not swept at startup.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = limiter.sweep();
                if removed > 0 {
                    tracing::debug!(removed, "swept idle rate-limit windows");
                }
            }
        })
    }

    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            active_keys: self.windows.lock().unwrap_or_else(|p| p.into_inner()).len(),
            total_checks: self.total_checks.load(Ordering::Relaxed),
            total_denied: self.total_denied.load(Ordering::Relaxed),
        }
    }
}
