//! Exponential backoff with jitter for reconnects and re-queries.

use rand::Rng;
use std::time::Duration;

/// Parameters of an exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub multiplier: f64,
    /// Relative jitter applied to every delay, `0.2` means ±20%.
    pub jitter: f64,
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            multiplier: 1.6,
            jitter: 0.2,
            max: Duration::from_secs(120),
        }
    }
}

/// Stateful backoff sequence built from a [`BackoffConfig`].
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            current: config.initial,
        }
    }

    /// The delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = base.mul_f64(self.config.multiplier).min(self.config.max);

        if self.config.jitter <= 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range(-self.config.jitter..=self.config.jitter);
        base.mul_f64(1.0 + factor)
    }

    /// Start over from the initial delay, e.g. after a successful attempt.
    pub fn reset(&mut self) {
        self.current = self.config.initial;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn grows_geometrically_up_to_max() {
        let mut backoff = Backoff::new(BackoffConfig {
            initial: Duration::from_millis(100),
            multiplier: 2.0,
            jitter: 0.0,
            max: Duration::from_millis(500),
        });
        let delays: Vec<_> = (0..5).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        for _ in 0..100 {
            backoff.reset();
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_millis(799), "{delay:?}");
            assert!(delay <= Duration::from_millis(1201), "{delay:?}");
        }
    }
}
