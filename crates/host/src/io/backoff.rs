//! Retry schedule shared by every retry site.

use std::time::Duration;

use rand::Rng;

/// Attempts made before giving up.
pub const MAX_ATTEMPTS: u32 = 5;

/// Delay before the first retry.
pub const INITIAL_BACKOFF_MS: u64 = 100;

/// Upper bound on any single delay.
pub const MAX_BACKOFF_MS: u64 = 7_000;

/// Growth factor between consecutive delays.
pub const BACKOFF_MULTIPLIER: f64 = 2.0;

/// Relative jitter applied to each delay (plus or minus).
pub const JITTER_FRACTION: f64 = 0.2;

/// Deadline for a single attempt.
pub const PER_TRY_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay to wait after failed attempt number `attempt` (zero-based).
pub fn delay(attempt: u32) -> Duration {
    let base = nominal_delay_ms(attempt);
    let jitter = rand::thread_rng().gen_range(-JITTER_FRACTION..=JITTER_FRACTION);
    let ms = (base * (1.0 + jitter)).min(MAX_BACKOFF_MS as f64);
    Duration::from_millis(ms.max(0.0) as u64)
}

fn nominal_delay_ms(attempt: u32) -> f64 {
    let grown = INITIAL_BACKOFF_MS as f64 * BACKOFF_MULTIPLIER.powi(attempt as i32);
    grown.min(MAX_BACKOFF_MS as f64)
}
