//! Backoff schedules for retry policies.

use std::time::Duration;

/// Delay schedule between retry attempts.
#[derive(Debug, Clone)]
pub enum Backoff {
    /// Same delay before every retry.
    Constant { delay: Duration },
    /// Delay grows linearly with the attempt number.
    Linear { base: Duration },
    /// Delay multiplied by `factor` after each attempt, capped at `max`.
    Exponential { base: Duration, factor: f64, max: Option<Duration> },
}

impl Backoff {
    pub fn constant(delay: Duration) -> Self {
        Backoff::Constant { delay }
    }

    pub fn linear(base: Duration) -> Self {
        Backoff::Linear { base }
    }

    /// Exponential schedule with the conventional doubling factor.
    pub fn exponential(base: Duration) -> Self {
        Backoff::Exponential { base, factor: 2.0, max: None }
    }

    /// Exponential schedule with a custom growth factor. Factors below 1.0
    /// are clamped to 1.0 so the schedule never shrinks.
    pub fn exponential_with_factor(base: Duration, factor: f64) -> Self {
        Backoff::Exponential { base, factor: factor.max(1.0), max: None }
    }

    /// Cap the delay of an exponential schedule. No effect on other kinds.
    pub fn with_max(mut self, cap: Duration) -> Self {
        if let Backoff::Exponential { max, .. } = &mut self {
            *max = Some(cap);
        }
        self
    }

    /// Delay before the given retry attempt (1-indexed).
    pub fn delay(&self, attempt: usize) -> Duration {
        match self {
            Backoff::Constant { delay } => *delay,
            Backoff::Linear { base } => base
                .checked_mul(attempt as u32)
                .unwrap_or(Duration::from_secs(u64::MAX)),
            Backoff::Exponential { base, factor, max } => {
                let exponent = attempt.saturating_sub(1) as i32;
                let multiplier = factor.max(1.0).powi(exponent);
                let millis = (base.as_millis() as f64 * multiplier).min(u64::MAX as f64);
                let delay = Duration::from_millis(millis as u64);
                match max {
                    Some(cap) => delay.min(*cap),
                    None => delay,
                }
            }
        }
    }
}
