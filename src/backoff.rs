//! Exponential backoff with jitter.
//!
//! Same shape as the `backoff::retry` helper this codebase family keeps
//! in its `utils` crate: `delay_n = min(cap, base * multiplier^(n-1)) +
//! jitter`, full jitter added on top rather than folded into the
//! exponent, so repeated failures spread out instead of synchronizing.

use std::time::Duration;

use rand::Rng;

use crate::settings::RetrySettings;

/// Compute the delay before retry attempt `attempt` (1-indexed: the delay
/// waited *before* making attempt number `attempt`).
pub fn delay_for_attempt(settings: &RetrySettings, attempt: u32) -> Duration {
    let exp = settings.multiplier.powi((attempt.saturating_sub(1)) as i32);
    let raw = settings.base.as_secs_f64() * exp;
    let capped = raw.min(settings.cap.as_secs_f64());
    let jitter: f64 = rand::thread_rng().gen_range(0.0..capped.max(0.001));
    Duration::from_secs_f64(capped + jitter)
}
