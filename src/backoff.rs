//! Exponential backoff for repeated spawn failures.

use std::time::Duration;

/// Calculate the delay before the next spawn attempt.
///
/// Returns `initial * 2^consecutive_failures`, capped at `max`.
pub fn backoff_delay(initial: Duration, consecutive_failures: u32, max: Duration) -> Duration {
    let factor = 1u32.checked_shl(consecutive_failures).unwrap_or(u32::MAX);
    initial.saturating_mul(factor).min(max)
}
