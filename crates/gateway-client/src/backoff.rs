//! Exponential reconnect backoff.

use std::time::Duration;

use crate::config::BackoffConfig;

/// Jitter applied to every delay, as a fraction of the nominal value.
const JITTER: f64 = 0.1;

/// Doubling delay sequence with a cap and ±10% jitter.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    next: Duration,
}

impl Backoff {
    /// Create a backoff at the start of its sequence.
    #[must_use]
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            base: config.base,
            cap: config.cap,
            next: config.base,
        }
    }

    /// The delay before the next attempt, advancing the sequence.
    #[must_use]
    pub fn next_delay(&mut self) -> Duration {
        let nominal = self.next.min(self.cap);
        self.next = (self.next * 2).min(self.cap);

        let jitter = 1.0 + (rand::random::<f64>() * 2.0 - 1.0) * JITTER;
        nominal.mul_f64(jitter)
    }

    /// Restart the sequence after a successful connection.
    pub fn reset(&mut self) {
        self.next = self.base;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BackoffConfig {
        BackoffConfig {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            max_attempts: None,
        }
    }

    fn assert_near(delay: Duration, nominal: u64) {
        let lo = Duration::from_secs(nominal).mul_f64(1.0 - JITTER);
        let hi = Duration::from_secs(nominal).mul_f64(1.0 + JITTER);
        assert!(
            delay >= lo && delay <= hi,
            "delay {delay:?} outside [{lo:?}, {hi:?}]"
        );
    }

    #[test]
    fn test_doubles_from_base() {
        let mut backoff = Backoff::new(&config());
        assert_near(backoff.next_delay(), 1);
        assert_near(backoff.next_delay(), 2);
        assert_near(backoff.next_delay(), 4);
    }

    #[test]
    fn test_never_exceeds_cap() {
        let mut backoff = Backoff::new(&config());
        let ceiling = Duration::from_secs(30).mul_f64(1.0 + JITTER);
        for _ in 0..20 {
            assert!(backoff.next_delay() <= ceiling);
        }
        assert_near(backoff.next_delay(), 30);
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut backoff = Backoff::new(&config());
        for _ in 0..6 {
            let _ = backoff.next_delay();
        }
        backoff.reset();
        assert_near(backoff.next_delay(), 1);
    }
}
