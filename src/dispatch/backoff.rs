//! Exponential backoff with jitter for message rescheduling (spec §4.7):
//! `delay(n) = min(base * 2^(n-1) + jitter, max)`, jitter uniform in
//! `[0, base)`.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self { base: Duration::from_secs(30), max: Duration::from_secs(3600) }
    }
}

impl BackoffConfig {
    /// `attempt` is 1-indexed: the delay before the first retry (the
    /// message's second attempt) is `delay(1)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let scaled = self.base.saturating_mul(1u32.checked_shl(exponent).unwrap_or(u32::MAX));
        let jitter_millis = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let jitter = if jitter_millis == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::rng().random_range(0..jitter_millis))
        };
        scaled.saturating_add(jitter).min(self.max)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn delay_grows_exponentially_and_caps_at_max() {
        let config = BackoffConfig { base: Duration::from_secs(1), max: Duration::from_secs(10) };

        assert!(config.delay(1) < Duration::from_secs(2));
        assert!(config.delay(2) >= Duration::from_secs(2));
        assert!(config.delay(2) < Duration::from_secs(3));
        assert_eq!(config.delay(20), Duration::from_secs(10));
    }

    #[test]
    fn zero_base_never_panics_on_jitter() {
        let config = BackoffConfig { base: Duration::ZERO, max: Duration::from_secs(5) };
        assert_eq!(config.delay(1), Duration::ZERO);
    }
}
