//! Retry policies and backoff.

use std::time::Duration;

use crate::core::errors::FailureClass;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_retries: u32,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Upper bound of the random extra delay, as a fraction of the delay.
    pub jitter_ratio: f64,
}

impl RetryPolicy {
    pub const MAX_DELAY: Duration = Duration::from_secs(60);

    pub fn exponential(base_delay: Duration, max_retries: u32) -> Self {
        Self {
            base_delay,
            max_retries,
            multiplier: 2.0,
            max_delay: Self::MAX_DELAY,
            jitter_ratio: 0.1,
        }
    }

    pub fn none() -> Self {
        Self::exponential(Duration::ZERO, 0)
    }

    /// Policy for a failure of the given class.
    pub fn for_class(class: FailureClass) -> Self {
        match class {
            FailureClass::Timeout => Self::exponential(Duration::from_secs(2), 3),
            FailureClass::Server => Self::exponential(Duration::from_secs(5), 2),
            FailureClass::RateLimit => Self::exponential(Duration::from_secs(10), 1),
            FailureClass::Network => Self::exponential(Duration::from_secs(2), 3),
            FailureClass::Unknown => Self::exponential(Duration::from_secs(1), 1),
            FailureClass::Client | FailureClass::Cancelled | FailureClass::Fatal => Self::none(),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// `base * multiplier^retry`, capped, plus `jitter` (in `[0, 1)`) times
    /// the jitter ratio.
    pub fn delay_for(&self, retry: u32, jitter: f64) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let raw = self.base_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64());
        let extra = capped * self.jitter_ratio.clamp(0.0, 1.0) * jitter.clamp(0.0, 1.0);
        Duration::from_secs_f64(capped + extra)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::for_class(FailureClass::Unknown)
    }
}

/// Delay sequence for one logical operation. Never yields a shorter delay
/// than the one before, even when the policy changes between attempts.
#[derive(Debug, Default)]
pub struct Backoff {
    previous: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_delay(
        &mut self,
        policy: &RetryPolicy,
        retry: u32,
        retry_after: Option<Duration>,
        jitter: f64,
    ) -> Duration {
        let mut delay = policy.delay_for(retry, jitter);
        if let Some(requested) = retry_after {
            delay = delay.max(requested.min(policy.max_delay));
        }
        delay = delay.max(self.previous);
        self.previous = delay;
        delay
    }
}
