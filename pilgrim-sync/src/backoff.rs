//! Reconnect delay state machine.
//!
//! Each failed attempt doubles the base delay up to the ceiling, then applies
//! symmetric jitter and floors the result at the minimum:
//!
//! ```text
//! base  = min(current * 2, ceiling)       current ← base
//! delay = max(floor, base * (1 ± jitter))
//! ```

use rand::Rng;
use std::time::Duration;

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// Floor and reset value (default: 1s)
    pub min_delay: Duration,
    /// Ceiling for the base delay (default: 30s)
    pub max_delay: Duration,
    /// Jitter as a fraction of the base delay (default: 0.2)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            jitter: 0.2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { current: config.min_delay, config }
    }

    /// Advance one failure and return how long to wait before retrying.
    pub fn next_delay<R: Rng>(&mut self, rng: &mut R) -> Duration {
        self.current = (self.current * 2).min(self.config.max_delay);

        let base = self.current.as_secs_f64();
        let jitter = self.config.jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            rng.gen_range(1.0 - jitter..=1.0 + jitter)
        } else {
            1.0
        };
        Duration::from_secs_f64(base * factor).max(self.config.min_delay)
    }

    /// Back to the floor; called after a successful connect or an online signal.
    pub fn reset(&mut self) {
        self.current = self.config.min_delay;
    }

    /// Base delay reached so far, without jitter.
    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn within(delay: Duration, base_ms: f64) -> bool {
        let ms = delay.as_secs_f64() * 1000.0;
        let low = (base_ms * 0.8).max(1000.0);
        let high = base_ms * 1.2;
        ms >= low - 1e-6 && ms <= high + 1e-6
    }

    #[test]
    fn test_first_failure_window() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let mut backoff = Backoff::default();
            let delay = backoff.next_delay(&mut rng);
            assert!(within(delay, 2000.0), "delay {delay:?}");
        }
    }

    #[test]
    fn test_nth_failure_window() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut backoff = Backoff::default();
        for n in 1..=10u32 {
            let base = (1000.0 * 2f64.powi(n as i32)).min(30_000.0);
            let delay = backoff.next_delay(&mut rng);
            assert!(within(delay, base), "attempt {n}: {delay:?} vs base {base}");
        }
        assert_eq!(backoff.current(), Duration::from_secs(30));
    }

    #[test]
    fn test_reset_returns_to_floor() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut backoff = Backoff::default();
        for _ in 0..6 {
            backoff.next_delay(&mut rng);
        }
        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_secs(1));
        assert!(within(backoff.next_delay(&mut rng), 2000.0));
    }

    #[test]
    fn test_floor_applies_after_jitter() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut backoff = Backoff::new(BackoffConfig {
            min_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(1000),
            jitter: 0.5,
        });
        for _ in 0..100 {
            assert!(backoff.next_delay(&mut rng) >= Duration::from_millis(1000));
        }
    }

    #[test]
    fn test_zero_jitter_is_deterministic() {
        let mut rng = StdRng::seed_from_u64(9);
        let mut backoff = Backoff::new(BackoffConfig { jitter: 0.0, ..BackoffConfig::default() });
        assert_eq!(backoff.next_delay(&mut rng), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(&mut rng), Duration::from_secs(4));
    }
}
