//! Exponential backoff shared by every transport component.
//!
//! `delay = min(1000 * 2^attempt, 30000) ms`, capped at 10 attempts.

use std::time::Duration;

/// Maximum number of reconnect attempts before giving up and surfacing
/// [`crate::error::SyncError::MaxReconnectExceeded`] via the status callback.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Compute the backoff delay before reconnect attempt `attempt` (0-indexed:
/// the first retry after a disconnect is attempt 0).
pub fn backoff_delay(attempt: u32) -> Duration {
    let ms = 1000u64.saturating_mul(1u64 << attempt.min(20));
    Duration::from_millis(ms.min(30_000))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps_at_thirty_seconds() {
        assert_eq!(backoff_delay(0), Duration::from_millis(1000));
        assert_eq!(backoff_delay(1), Duration::from_millis(2000));
        assert_eq!(backoff_delay(4), Duration::from_millis(16_000));
        assert_eq!(backoff_delay(5), Duration::from_millis(30_000));
        assert_eq!(backoff_delay(10), Duration::from_millis(30_000));
    }
}
