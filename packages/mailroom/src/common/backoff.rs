//! Retry backoff computation.
//!
//! Delays grow exponentially from a base, capped at a maximum, with jitter
//! applied separately so the pre-jitter curve stays monotonic.

use rand::Rng;
use std::time::Duration;

/// Compute the backoff delay for a retry attempt (1-based), before jitter.
///
/// `attempt = 1` yields `base`; each further attempt doubles the delay up
/// to `max`.
pub fn backoff_delay(attempt: i32, base: Duration, max: Duration) -> Duration {
    let attempt = attempt.max(1) as u32;
    // Saturate the shift so huge attempt numbers can't overflow.
    let factor = 2u64.saturating_pow(attempt - 1);
    let delay = base.as_secs().saturating_mul(factor);
    Duration::from_secs(delay.min(max.as_secs()))
}

/// Apply ±`fraction` jitter to a delay (e.g. 0.2 for ±20 %).
pub fn with_jitter(delay: Duration, fraction: f64) -> Duration {
    let mut rng = rand::thread_rng();
    let spread = rng.gen_range(-fraction..=fraction);
    let secs = delay.as_secs_f64() * (1.0 + spread);
    Duration::from_secs_f64(secs.max(0.0))
}
