//! In-process retry policy: exponential backoff with a hard cap, after which
//! the message transfers to the DLQ. Broker redelivery is not used for
//! retries; the attempt counter lives with the message being processed.

use std::time::Duration;

use rsk_config::Settings;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_retries: settings.max_retries,
            base_delay: Duration::from_millis(settings.retry_base_delay_ms),
        }
    }

    /// `completed` counts retries already performed for this message.
    pub fn should_retry(&self, completed: u32) -> bool {
        completed < self.max_retries
    }

    /// Backoff before retry number `attempt + 1`: `base * 2^attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        // Shift capped well below u32 range; attempts are single digits in
        // practice.
        self.base_delay * (1u32 << attempt.min(20))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_retries: u32, base_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(base_ms),
        }
    }

    #[test]
    fn backoff_doubles_from_base() {
        let p = policy(3, 100);
        assert_eq!(p.delay(0), Duration::from_millis(100));
        assert_eq!(p.delay(1), Duration::from_millis(200));
        assert_eq!(p.delay(2), Duration::from_millis(400));
    }

    #[test]
    fn worst_case_total_wait_is_seven_base() {
        let p = policy(3, 100);
        let total: Duration = (0..p.max_retries).map(|i| p.delay(i)).sum();
        assert_eq!(total, Duration::from_millis(700));
    }

    #[test]
    fn retry_budget_is_bounded() {
        let p = policy(3, 100);
        assert!(p.should_retry(0));
        assert!(p.should_retry(2));
        assert!(!p.should_retry(3));
        assert!(!p.should_retry(4));

        let none = policy(0, 100);
        assert!(!none.should_retry(0));
    }
}
