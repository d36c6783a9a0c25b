//! Reconnection backoff.

use rand::Rng;
use std::time::Duration;

/// How a relay connection retries after its transport drops.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Reconnect after an unexpected close or error.
    pub enabled: bool,
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Growth factor applied after each failed attempt.
    pub multiplier: f64,
    /// Upper bound for a single delay.
    pub max_delay: Duration,
    /// Failed attempts before giving up (0 = infinite).
    pub max_attempts: u32,
    /// Fraction of each delay randomized away, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_millis(100),
            multiplier: 1.5,
            max_delay: Duration::from_secs(60),
            max_attempts: 0,
            jitter: 0.1,
        }
    }
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.clone())
    }
}

/// Delay sequence for a connection's reconnect attempts.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Failed attempts recorded so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Record a failed attempt and return the wait before the next one, or
    /// `None` once `max_attempts` failures have been recorded.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.policy.max_attempts != 0 && self.attempt >= self.policy.max_attempts {
            return None;
        }
        let base = self.base_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        Some(self.apply_jitter(base))
    }

    fn base_delay(&self, attempt: u32) -> Duration {
        let initial = self.policy.initial_delay.as_secs_f64();
        let max = self.policy.max_delay.as_secs_f64();
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let grown = initial * self.policy.multiplier.max(1.0).powi(exponent);
        Duration::try_from_secs_f64(grown.min(max)).unwrap_or(self.policy.max_delay)
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        let jitter = if self.policy.jitter.is_finite() {
            self.policy.jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if jitter == 0.0 {
            return delay;
        }
        let factor = 1.0 - rand::rng().random_range(0.0..=jitter);
        delay.mul_f64(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_millis(500),
            max_attempts,
            jitter: 0.0,
            ..ReconnectPolicy::default()
        }
    }

    #[test]
    fn delays_grow_and_cap() {
        let mut backoff = policy(0).backoff();
        let delays: Vec<_> = (0..5).filter_map(|_| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(500),
                Duration::from_millis(500),
            ]
        );
        assert_eq!(backoff.attempt(), 5);
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let mut backoff = policy(2).backoff();
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert_eq!(backoff.next_delay(), None);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn jitter_only_shortens() {
        let mut backoff = ReconnectPolicy {
            jitter: 0.5,
            ..policy(0)
        }
        .backoff();
        for _ in 0..20 {
            let base = backoff.base_delay(backoff.attempt());
            let delay = backoff.next_delay().unwrap_or_default();
            assert!(delay <= base);
            assert!(delay >= base.mul_f64(0.5));
        }
    }

    #[test]
    fn non_finite_jitter_is_ignored() {
        for jitter in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let mut backoff = ReconnectPolicy { jitter, ..policy(0) }.backoff();
            assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
        }
    }

    #[test]
    fn default_policy_matches_relay_defaults() {
        let policy = ReconnectPolicy::default();
        assert!(policy.enabled);
        assert_eq!(policy.max_attempts, 0);
        assert!(!ReconnectPolicy::disabled().enabled);
    }
}
