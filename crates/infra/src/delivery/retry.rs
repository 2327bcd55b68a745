//! Retry schedules for destination publishes, dead-letter writes and offset
//! commits.
//!
//! Delays are a pure function of the policy, the attempt number and the
//! record being retried, so a worker can recompute them after a restart and
//! tests can assert exact values.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::record::TrackingId;

/// How the delay grows from one attempt to the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    Constant,
    /// `initial_delay * 2^(attempt - 1)`, capped at `max_delay`.
    #[default]
    Doubling,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts allowed in total; the first one counts.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff: Backoff,
    /// Largest share of a delay (0.0 to 1.0) that jitter may shave off.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::doubling(5, Duration::from_millis(500), Duration::from_secs(30))
    }
}

impl RetryPolicy {
    /// A single attempt, never retried.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Same delay before every retry, without jitter.
    pub fn constant(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            max_delay: delay,
            backoff: Backoff::Constant,
            jitter: 0.0,
        }
    }

    pub fn doubling(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay: max_delay.max(initial_delay),
            backoff: Backoff::Doubling,
            jitter: 0.1,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Delay after failed attempt `attempt` (1-based), before jitter.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        match self.backoff {
            Backoff::Constant => self.initial_delay,
            Backoff::Doubling => {
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                self.initial_delay.saturating_mul(factor).min(self.max_delay)
            }
        }
    }

    /// Delay before retrying `id` after failed attempt `attempt`.
    ///
    /// Jitter only shortens the nominal delay, so `max_delay` still holds. It
    /// is keyed on the record, so partitions that fail together on the same
    /// attempt wake up at different times.
    pub fn delay_for(&self, attempt: u32, id: TrackingId) -> Duration {
        let nominal = self.nominal_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || nominal.is_zero() {
            return nominal;
        }
        nominal.mul_f64(1.0 - jitter * spread(id, attempt))
    }
}

/// Uniform value in `[0, 1)` derived from the record and attempt (splitmix64).
fn spread(id: TrackingId, attempt: u32) -> f64 {
    let mut z = u64::from(id.partition.get()).wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ id.offset.get().wrapping_mul(0xBF58_476D_1CE4_E5B9)
        ^ u64::from(attempt).wrapping_mul(0x94D0_49BB_1331_11EB);
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^= z >> 31;
    (z >> 11) as f64 / (1u64 << 53) as f64
}
