//! Exponential backoff shared by the RPC connection and the feed stream.

use std::time::Duration;

/// Maximum number of reconnection attempts before giving up
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Initial backoff delay for reconnection
pub const INITIAL_BACKOFF_MS: u64 = 100;

/// Maximum backoff delay for reconnection
pub const MAX_BACKOFF_MS: u64 = 30000;

/// Reconnection schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Maximum reconnection attempts
    pub max_attempts: u32,
    /// Initial backoff delay in milliseconds
    pub initial_backoff_ms: u64,
    /// Maximum backoff delay in milliseconds
    pub max_backoff_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_RECONNECT_ATTEMPTS,
            initial_backoff_ms: INITIAL_BACKOFF_MS,
            max_backoff_ms: MAX_BACKOFF_MS,
        }
    }
}

impl BackoffPolicy {
    /// Calculate backoff delay for a given attempt number
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay_ms = self.initial_backoff_ms.saturating_mul(2u64.pow(attempt.min(10)));
        Duration::from_millis(delay_ms.min(self.max_backoff_ms))
    }

    /// Whether another attempt is allowed after `attempts` failures
    pub fn allows(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_default() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.max_attempts, MAX_RECONNECT_ATTEMPTS);
        assert_eq!(policy.initial_backoff_ms, INITIAL_BACKOFF_MS);
        assert_eq!(policy.max_backoff_ms, MAX_BACKOFF_MS);
    }

    #[test]
    fn test_backoff_delay_doubles() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
    }

    #[test]
    fn test_backoff_delay_caps_at_max() {
        let policy = BackoffPolicy {
            max_backoff_ms: 1000,
            initial_backoff_ms: 100,
            ..Default::default()
        };
        assert_eq!(policy.delay(10), Duration::from_millis(1000));
        assert_eq!(policy.delay(20), Duration::from_millis(1000));
    }

    #[test]
    fn test_backoff_allows_up_to_max_attempts() {
        let policy = BackoffPolicy {
            max_attempts: 2,
            ..Default::default()
        };
        assert!(policy.allows(0));
        assert!(policy.allows(1));
        assert!(!policy.allows(2));
    }

    #[test]
    fn test_backoff_values_reasonable() {
        assert!(INITIAL_BACKOFF_MS >= 50);
        assert!(INITIAL_BACKOFF_MS <= 1000);
        assert!(MAX_BACKOFF_MS >= 10000);
        assert!(MAX_BACKOFF_MS <= 60000);
    }
}
