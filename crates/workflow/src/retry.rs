use std::time::Duration;

/// Per-step retry budget with exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Bound on a single attempt; exceeding it is a transient failure
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 6,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(5 * 60),
            timeout: Duration::from_secs(10 * 60),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor: u32 = 2u32
            .checked_pow(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);

        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn has_attempts_left(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

#[cfg(test)]
impl RetryPolicy {
    /// Millisecond backoff so retry tests finish quickly.
    pub(crate) fn fast(max_attempts: u32) -> Self {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            timeout: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_capped() {
        let policy: RetryPolicy = RetryPolicy::default();

        let delays: Vec<u64> = (1..=7)
            .map(|attempt| policy.delay_for(attempt).as_secs())
            .collect();

        assert_eq!(vec![10, 20, 40, 80, 160, 300, 300], delays);
    }

    #[test]
    fn huge_attempt_numbers_do_not_overflow() {
        let policy: RetryPolicy = RetryPolicy::default();

        assert_eq!(policy.max_delay, policy.delay_for(u32::MAX));
    }

    #[test]
    fn budget_counts_the_first_attempt() {
        let policy: RetryPolicy = RetryPolicy::default();

        assert!(policy.has_attempts_left(5));
        assert!(!policy.has_attempts_left(6));
    }
}
