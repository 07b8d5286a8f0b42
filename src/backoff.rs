//! Backoff curves for retry delays.

use std::time::Duration;

/// Delay strategy between attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    /// Fixed delay between retries.
    Constant { delay: Duration },
    /// Delay grows linearly with the attempt number.
    Linear { base: Duration },
    /// `base · multiplier^(attempt-1)`, capped at `max` when set.
    Exponential { base: Duration, multiplier: f64, max: Option<Duration> },
}

impl Backoff {
    pub fn constant(delay: Duration) -> Self {
        Backoff::Constant { delay }
    }

    pub fn linear(base: Duration) -> Self {
        Backoff::Linear { base }
    }

    /// Doubling exponential backoff.
    pub fn exponential(base: Duration) -> Self {
        Backoff::Exponential { base, multiplier: 2.0, max: None }
    }

    /// Exponential backoff with an explicit growth factor (≥ 1).
    pub fn exponential_with_multiplier(base: Duration, multiplier: f64) -> Self {
        Backoff::Exponential { base, multiplier: multiplier.max(1.0), max: None }
    }

    /// Cap the delay for exponential backoff; no effect on other curves.
    pub fn with_max(mut self, cap: Duration) -> Self {
        if let Backoff::Exponential { max: ref mut m, .. } = self {
            *m = Some(cap);
        }
        self
    }

    /// Delay before the given attempt (1-indexed: the sleep after the
    /// first failure is `delay(1)`).
    pub fn delay(&self, attempt: usize) -> Duration {
        match self {
            Backoff::Constant { delay } => *delay,
            Backoff::Linear { base } => base
                .checked_mul(attempt as u32)
                .unwrap_or(Duration::from_secs(u64::MAX)),
            Backoff::Exponential { base, multiplier, max } => {
                let exponent = attempt.saturating_sub(1) as i32;
                let factor = multiplier.powi(exponent);
                let millis = (base.as_millis() as f64 * factor).min(u64::MAX as f64);
                let delay = Duration::from_millis(millis as u64);
                match max {
                    Some(cap) => delay.min(*cap),
                    None => delay,
                }
            }
        }
    }
}
