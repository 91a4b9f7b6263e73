//! Jitter strategies for spreading out synchronized retries.

use rand::Rng;
use std::time::Duration;

/// Randomization applied on top of a backoff delay.
#[derive(Debug, Clone)]
pub enum Jitter {
    /// Use the backoff delay exactly as computed.
    None,
    /// Uniform random delay in `[0, delay]`.
    Full,
    /// Uniform random delay in `[delay/2, delay]`.
    Equal,
}

impl Jitter {
    pub fn full() -> Self {
        Jitter::Full
    }

    pub fn equal() -> Self {
        Jitter::Equal
    }

    /// Apply this strategy to a computed delay.
    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rand::rng())
    }

    /// Apply with a caller-provided RNG. Lets tests pin the randomness.
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        let millis = delay.as_millis() as u64;
        if millis == 0 {
            return Duration::ZERO;
        }
        match self {
            Jitter::None => delay,
            Jitter::Full => Duration::from_millis(rng.random_range(0..=millis)),
            Jitter::Equal => Duration::from_millis(rng.random_range(millis / 2..=millis)),
        }
    }
}

impl Default for Jitter {
    fn default() -> Self {
        Jitter::None
    }
}
