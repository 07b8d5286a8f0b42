//! Jitter strategies to keep retrying executions from stampeding.

use rand::Rng;
use std::time::Duration;

/// Randomization applied on top of a computed backoff delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// Use the exact delay.
    None,
    /// Random in [0, delay].
    Full,
    /// Random in [delay/2, delay].
    Equal,
    /// Additive: delay + random in [0, delay · fraction]. The runtime
    /// default is `fraction = 0.25` (0–25 % extra).
    Fraction(f64),
}

impl Jitter {
    pub fn full() -> Self {
        Jitter::Full
    }

    pub fn equal() -> Self {
        Jitter::Equal
    }

    /// Bounded additive jitter; `fraction` is clamped to [0, 1].
    pub fn fraction(fraction: f64) -> Self {
        Jitter::Fraction(fraction.clamp(0.0, 1.0))
    }

    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rand::rng())
    }

    /// Deterministic variant for tests.
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        let millis = delay.as_millis() as u64;
        match self {
            Jitter::None => delay,
            Jitter::Full => {
                if millis == 0 {
                    return Duration::ZERO;
                }
                Duration::from_millis(rng.random_range(0..=millis))
            }
            Jitter::Equal => {
                if millis == 0 {
                    return Duration::ZERO;
                }
                Duration::from_millis(rng.random_range(millis / 2..=millis))
            }
            Jitter::Fraction(fraction) => {
                let bound = (millis as f64 * fraction) as u64;
                if bound == 0 {
                    return delay;
                }
                delay + Duration::from_millis(rng.random_range(0..=bound))
            }
        }
    }
}
