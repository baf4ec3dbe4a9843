//! Reconnect backoff and circuit breaker for the agent connection.
//!
//! Each failed attempt (transport error, remote close, auth rejection)
//! bumps `consecutive_failures`. Below the threshold the retry delay grows
//! exponentially from `base_delay` with upward jitter, capped at
//! `max_delay`. At the threshold the circuit opens and every retry waits
//! the fixed `long_backoff` until one authenticated session resets it.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Tuning for [`ReconnectPolicy`].
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Upper bound for the exponential delay.
    pub max_delay: Duration,
    /// Fixed delay while the circuit is open.
    pub long_backoff: Duration,
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Upward jitter as a fraction of the exponential delay (0.0-0.5).
    pub jitter_ratio: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            long_backoff: Duration::from_secs(60),
            failure_threshold: 5,
            jitter_ratio: 0.1,
        }
    }
}

impl ReconnectConfig {
    /// Disable jitter (deterministic delays).
    pub fn without_jitter(mut self) -> Self {
        self.jitter_ratio = 0.0;
        self
    }
}

/// Breaker snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerState {
    pub consecutive_failures: u32,
    pub open: bool,
}

/// Backoff state machine. Owned by one connection manager.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    state: CircuitBreakerState,
    attempt: u32,
}

impl ReconnectPolicy {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            state: CircuitBreakerState::default(),
            attempt: 0,
        }
    }

    pub fn state(&self) -> CircuitBreakerState {
        self.state
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    /// Record a failed attempt and return the delay before the next one.
    pub fn record_failure(&mut self) -> Duration {
        let unit = rand::thread_rng().gen_range(0.0..1.0);
        self.record_failure_with_jitter(unit)
    }

    /// Like [`record_failure`](Self::record_failure) with an explicit
    /// jitter sample in `[0, 1)`.
    pub fn record_failure_with_jitter(&mut self, unit: f64) -> Duration {
        self.state.consecutive_failures = self.state.consecutive_failures.saturating_add(1);
        if self.state.consecutive_failures >= self.config.failure_threshold {
            self.state.open = true;
        }

        if self.state.open {
            return self.config.long_backoff;
        }

        let delay = self.exponential_delay(unit);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Reset after an authenticated session.
    pub fn record_success(&mut self) {
        self.state = CircuitBreakerState::default();
        self.attempt = 0;
    }

    fn exponential_delay(&self, unit: f64) -> Duration {
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        let exp = self.config.base_delay.saturating_mul(factor);
        if exp >= self.config.max_delay {
            return self.config.max_delay;
        }
        let ratio = self.config.jitter_ratio.clamp(0.0, 0.5);
        let jittered = exp.mul_f64(1.0 + ratio * unit.clamp(0.0, 1.0));
        jittered.min(self.config.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ReconnectConfig {
        ReconnectConfig {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            long_backoff: Duration::from_millis(60_000),
            failure_threshold: 5,
            jitter_ratio: 0.1,
        }
    }

    #[test]
    fn test_first_failure_uses_base_delay() {
        let mut policy = ReconnectPolicy::new(config());
        let delay = policy.record_failure();
        assert!(delay >= Duration::from_millis(1000));
        assert!(delay <= Duration::from_millis(1100));
        assert_eq!(policy.state().consecutive_failures, 1);
        assert!(!policy.state().open);
    }

    #[test]
    fn test_delays_strictly_increase_below_threshold() {
        let cfg = ReconnectConfig {
            failure_threshold: 20,
            max_delay: Duration::from_secs(3600),
            ..config()
        };
        let mut policy = ReconnectPolicy::new(cfg);
        let mut previous = Duration::ZERO;
        for i in 0..8 {
            // Worst case: max jitter first, none after.
            let unit = if i % 2 == 0 { 0.999 } else { 0.0 };
            let delay = policy.record_failure_with_jitter(unit);
            assert!(delay > previous, "delay {:?} <= {:?}", delay, previous);
            previous = delay;
        }
    }

    #[test]
    fn test_delay_capped_at_max() {
        let cfg = ReconnectConfig {
            failure_threshold: 100,
            ..config()
        };
        let mut policy = ReconnectPolicy::new(cfg);
        let delays: Vec<_> = (0..10)
            .map(|_| policy.record_failure_with_jitter(0.5))
            .collect();
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(10_000)));
        assert_eq!(delays[9], Duration::from_millis(10_000));
    }

    #[test]
    fn test_circuit_opens_at_threshold() {
        let mut policy = ReconnectPolicy::new(config().without_jitter());
        for _ in 0..4 {
            let delay = policy.record_failure();
            assert!(delay < Duration::from_millis(60_000));
        }
        assert!(!policy.state().open);

        let fifth = policy.record_failure();
        assert!(policy.state().open);
        assert_eq!(fifth, Duration::from_millis(60_000));

        let sixth = policy.record_failure();
        assert_eq!(sixth, Duration::from_millis(60_000));
        assert_eq!(policy.state().consecutive_failures, 6);
    }

    #[test]
    fn test_success_resets_breaker_and_backoff() {
        let mut policy = ReconnectPolicy::new(config().without_jitter());
        for _ in 0..6 {
            policy.record_failure();
        }
        assert!(policy.state().open);

        policy.record_success();
        assert_eq!(policy.state(), CircuitBreakerState::default());
        assert_eq!(policy.record_failure(), Duration::from_millis(1000));
    }

    #[test]
    fn test_without_jitter_is_deterministic() {
        let mut policy = ReconnectPolicy::new(config().without_jitter());
        assert_eq!(policy.record_failure(), Duration::from_millis(1000));
        assert_eq!(policy.record_failure(), Duration::from_millis(2000));
        assert_eq!(policy.record_failure(), Duration::from_millis(4000));
    }
}
