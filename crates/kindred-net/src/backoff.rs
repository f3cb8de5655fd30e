use std::time::Duration;

use rand::Rng;

use kindred_shared::constants::{
    RECONNECT_ATTEMPTS, RECONNECT_BASE_DELAY, RECONNECT_JITTER, RECONNECT_MAX_DELAY,
};

/// Capped exponential backoff with jitter for involuntary reconnects.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Attempts after a loss before giving up. Zero disables reconnecting.
    pub max_attempts: u32,
    /// Delay before the first attempt; doubles for each following one.
    pub base_delay: Duration,
    /// Cap applied to the doubled delay, before jitter.
    pub max_delay: Duration,
    /// Upper bound of the random extra delay, as a fraction of the delay.
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: RECONNECT_ATTEMPTS,
            base_delay: RECONNECT_BASE_DELAY,
            max_delay: RECONNECT_MAX_DELAY,
            jitter: RECONNECT_JITTER,
        }
    }
}

impl ReconnectPolicy {
    /// Policy without jitter, for deterministic timing.
    pub fn fixed(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter: 0.0,
        }
    }

    /// Whether attempt number `attempt` (1-based) may still run.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt >= 1 && attempt <= self.max_attempts
    }

    /// Delay before attempt `attempt` (1-based), without jitter.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        delay.min(self.max_delay)
    }

    /// Delay before attempt `attempt` with a jitter sample in `[0, 1)`.
    pub fn delay_for(&self, attempt: u32, sample: f64) -> Duration {
        let base = self.base_delay_for(attempt);
        let factor = self.jitter.max(0.0) * sample.clamp(0.0, 1.0);
        base + base.mul_f64(factor)
    }

    /// Delay before attempt `attempt`, with random jitter.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let sample = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(0.0..1.0)
        } else {
            0.0
        };
        self.delay_for(attempt, sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_from_base() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (1..=5)
            .map(|n| policy.base_delay_for(n).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = ReconnectPolicy::fixed(10, Duration::from_secs(1), Duration::from_secs(30));
        assert_eq!(policy.base_delay_for(6), Duration::from_secs(30));
        assert_eq!(policy.base_delay_for(40), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(2, 0.0), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2, 1.0), Duration::from_millis(2600));

        for _ in 0..100 {
            let delay = policy.next_delay(3);
            assert!(delay >= Duration::from_secs(4));
            assert!(delay <= Duration::from_millis(5200));
        }
    }

    #[test]
    fn test_attempt_cap() {
        let policy = ReconnectPolicy::default();
        assert!(!policy.allows(0));
        assert!(policy.allows(1));
        assert!(policy.allows(5));
        assert!(!policy.allows(6));
    }
}
