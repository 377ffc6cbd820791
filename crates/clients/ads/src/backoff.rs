//! Bounded exponential backoff for the ads REST client.
//!
//! The ads API has no cost telemetry, so throttling is handled reactively:
//! retry 429/5xx with exponentially growing delays and a little jitter so
//! parallel workers do not re-align on the same instant.

use std::time::Duration;

use rand::Rng;

/// Attempts per call, first try included.
pub const MAX_ATTEMPTS: u32 = 5;
/// Delay before the first retry.
pub const BASE_DELAY: Duration = Duration::from_secs(1);
/// Ceiling on the exponential delay, jitter excluded.
pub const MAX_DELAY: Duration = Duration::from_secs(60);
/// Upper bound of the random jitter added to every delay.
pub const MAX_JITTER: Duration = Duration::from_millis(250);

/// Delay before retry number `attempt` (1-based): 1 s doubled per attempt,
/// capped at 60 s, plus 0-250 ms of jitter.
pub fn delay(attempt: u32) -> Duration {
    let exp = BASE_DELAY.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
    exp.min(MAX_DELAY) + jitter()
}

fn jitter() -> Duration {
    let millis = rand::thread_rng().gen_range(0..=MAX_JITTER.as_millis() as u64);
    Duration::from_millis(millis)
}
