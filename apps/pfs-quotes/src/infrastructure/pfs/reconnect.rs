//! Reconnection Policy
//!
//! Exponential backoff with jitter between connection attempts. The delay
//! for attempt `n` is `initial * multiplier^(n-1)`, capped at `max_delay`,
//! then spread by `±jitter_factor`. A successful session open resets the
//! policy.

use std::time::Duration;

use rand::Rng;

use crate::infrastructure::config::ConnectionSettings;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay, before jitter.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Jitter as a fraction of the delay (0.1 = ±10%).
    pub jitter_factor: f64,
    /// Maximum number of reconnection attempts (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 10,
        }
    }
}

impl ReconnectConfig {
    /// Build from connection settings.
    #[must_use]
    pub const fn from_settings(settings: &ConnectionSettings) -> Self {
        Self {
            initial_delay: settings.reconnect_delay_initial,
            max_delay: settings.reconnect_delay_max,
            multiplier: settings.reconnect_delay_multiplier,
            jitter_factor: settings.reconnect_jitter,
            max_attempts: settings.max_reconnect_attempts,
        }
    }

    /// Whether attempts are unlimited.
    #[must_use]
    pub const fn is_unlimited(&self) -> bool {
        self.max_attempts == 0
    }

    /// Backoff delay for a 1-based attempt number, before jitter.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.multiplier.max(1.0).powi(exponent);
        let capped = self.max_delay.as_secs_f64();
        let secs = self.initial_delay.as_secs_f64() * factor;

        if !secs.is_finite() || secs >= capped {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// Stateful backoff schedule for one session.
///
/// # Example
///
/// ```rust
/// use pfs_quotes::infrastructure::pfs::reconnect::{ReconnectConfig, ReconnectPolicy};
/// use std::time::Duration;
///
/// let mut policy = ReconnectPolicy::new(ReconnectConfig {
///     jitter_factor: 0.0,
///     max_attempts: 2,
///     ..ReconnectConfig::default()
/// });
///
/// assert_eq!(policy.next_delay().unwrap(), Duration::from_secs(1));
/// assert_eq!(policy.next_delay().unwrap(), Duration::from_secs(2));
/// assert!(policy.next_delay().is_err());
///
/// // A session opened again.
/// policy.reset();
/// assert_eq!(policy.attempt_count(), 0);
/// ```
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempt_count: u32,
}

impl ReconnectPolicy {
    /// Create a new reconnection policy.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempt_count: 0,
        }
    }

    /// Delay before the next attempt.
    ///
    /// # Errors
    ///
    /// Returns [`ReconnectError::MaxAttemptsExceeded`] once the attempt budget is spent.
    pub fn next_delay(&mut self) -> Result<Duration, ReconnectError> {
        if !self.should_retry() {
            return Err(ReconnectError::MaxAttemptsExceeded(self.attempt_count));
        }

        self.attempt_count += 1;
        Ok(self.apply_jitter(self.config.base_delay(self.attempt_count)))
    }

    /// Forget past failures.
    pub const fn reset(&mut self) {
        self.attempt_count = 0;
    }

    /// Attempts made since the last reset.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Whether another attempt is allowed.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.config.is_unlimited() || self.attempt_count < self.config.max_attempts
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return duration;
        }

        let base = duration.as_secs_f64();
        let spread = base * self.config.jitter_factor;
        let jitter: f64 = rand::rng().random_range(-spread..=spread);

        Duration::from_secs_f64((base + jitter).max(0.001))
    }
}

/// Error type for reconnection failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconnectError {
    /// Maximum reconnection attempts exceeded.
    #[error("maximum reconnection attempts ({0}) exceeded")]
    MaxAttemptsExceeded(u32),
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn no_jitter(initial_ms: u64, max_ms: u64, multiplier: f64, max_attempts: u32) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
            multiplier,
            jitter_factor: 0.0,
            max_attempts,
        }
    }

    #[test]
    fn default_config_values() {
        let config = ReconnectConfig::default();
        assert_eq!(config.initial_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert_eq!(config.max_attempts, 10);
        assert!(!config.is_unlimited());
    }

    #[test]
    fn delays_double_until_cap() {
        let mut policy = ReconnectPolicy::new(no_jitter(100, 700, 2.0, 0));

        let delays: Vec<_> = (0..5).map(|_| policy.next_delay().unwrap()).collect();

        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(700),
                Duration::from_millis(700),
            ]
        );
    }

    #[test]
    fn exhaustion_reports_attempts() {
        let mut policy = ReconnectPolicy::new(no_jitter(10, 100, 2.0, 2));

        assert!(policy.next_delay().is_ok());
        assert!(policy.next_delay().is_ok());
        assert_eq!(
            policy.next_delay(),
            Err(ReconnectError::MaxAttemptsExceeded(2))
        );
        assert!(!policy.should_retry());
    }

    #[test]
    fn reset_restarts_schedule() {
        let mut policy = ReconnectPolicy::new(no_jitter(50, 1_000, 3.0, 3));
        let _ = policy.next_delay();
        let _ = policy.next_delay();

        policy.reset();

        assert_eq!(policy.attempt_count(), 0);
        assert_eq!(policy.next_delay().unwrap(), Duration::from_millis(50));
    }

    #[test]
    fn huge_attempt_number_saturates_at_cap() {
        let config = no_jitter(1_000, 30_000, 2.0, 0);
        assert_eq!(config.base_delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn unlimited_never_exhausts() {
        let mut policy = ReconnectPolicy::new(no_jitter(1, 5, 2.0, 0));
        for _ in 0..500 {
            assert!(policy.next_delay().is_ok());
        }
    }

    proptest! {
        #[test]
        fn jittered_delay_stays_in_band(
            initial_ms in 10u64..5_000,
            attempt in 1u32..20,
            jitter in 0.0f64..0.5,
        ) {
            let config = ReconnectConfig {
                initial_delay: Duration::from_millis(initial_ms),
                max_delay: Duration::from_secs(30),
                multiplier: 2.0,
                jitter_factor: jitter,
                max_attempts: 0,
            };
            let base = config.base_delay(attempt).as_secs_f64();
            let mut policy = ReconnectPolicy::new(config);
            for _ in 1..attempt {
                let _ = policy.next_delay();
            }

            let delay = policy.next_delay().unwrap().as_secs_f64();

            prop_assert!(delay >= base * (1.0 - jitter) - 1e-6);
            prop_assert!(delay <= base * (1.0 + jitter) + 1e-6);
        }

        #[test]
        fn base_delay_is_monotonic(initial_ms in 1u64..2_000, attempt in 1u32..40) {
            let config = no_jitter(initial_ms, 60_000, 2.0, 0);
            prop_assert!(config.base_delay(attempt) <= config.base_delay(attempt + 1));
            prop_assert!(config.base_delay(attempt) <= Duration::from_secs(60));
        }
    }
}
