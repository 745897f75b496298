use std::time::Duration;

/// Transport-level retry policy for transient provider failures.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    /// A single attempt; failures surface immediately.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_delay_ms: 0,
            backoff_factor: 1.0,
            max_delay_ms: 0,
        }
    }

    pub fn exponential(max_attempts: u32, initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay_ms,
            backoff_factor: 2.0,
            max_delay_ms,
        }
    }

    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before the attempt following `attempt` (1-based).
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1) as i32;
        let base = (self.initial_delay_ms as f64) * self.backoff_factor.powi(exp);
        let delay = base.min(self.max_delay_ms as f64).round().max(0.0);
        Duration::from_millis(delay as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_policy_doubles_until_cap() {
        let policy = RetryPolicy::exponential(5, 500, 1_500);
        assert_eq!(policy.delay_after_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_after_attempt(2), Duration::from_millis(1_000));
        assert_eq!(policy.delay_after_attempt(3), Duration::from_millis(1_500));
        assert!(policy.allows_retry_after(4));
        assert!(!policy.allows_retry_after(5));
    }

    #[test]
    fn none_policy_never_retries() {
        let policy = RetryPolicy::none();
        assert!(!policy.allows_retry_after(1));
    }
}
