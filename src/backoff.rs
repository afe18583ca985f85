//! Exponential backoff schedule shared by discovery, command retries, and
//! reconnection.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with a clamp and ±25% jitter.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Backoff {
        Backoff { base, max }
    }

    /// Delay before retry number `attempt` (zero-based): `base * 2^attempt`,
    /// clamped to `max`, then jittered.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base
            .checked_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
            .unwrap_or(self.max);
        let clamped = exp.min(self.max);
        let factor = rand::thread_rng().gen_range(0.75..=1.25);
        clamped.mul_f64(factor)
    }
}
