// engine/backoff.rs - Exponential backoff with jitter

use rand::Rng;
use std::time::Duration;

/// Exponential backoff: doubles from an initial delay up to a cap, with
/// ±20% jitter so reconnecting clients do not stampede the coordinator.
#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            attempt: 0,
        }
    }

    /// Delay for the next retry, advancing the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.attempt.min(31);
        self.attempt = self.attempt.saturating_add(1);

        let base = self
            .initial
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max);

        let jitter = rand::thread_rng().gen_range(-0.2f64..=0.2f64);
        let jittered = base.as_secs_f64() * (1.0 + jitter);
        Duration::from_secs_f64(jittered.max(0.0))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_up_to_the_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        let expectations = [1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 60.0, 60.0];
        for expected in expectations {
            let delay = backoff.next_delay().as_secs_f64();
            let low = expected * 0.8;
            let high = expected * 1.2;
            assert!(
                (low..=high).contains(&delay),
                "delay {} outside [{}, {}]",
                delay,
                low,
                high
            );
        }
    }

    #[test]
    fn reset_returns_to_initial() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        let delay = backoff.next_delay().as_secs_f64();
        assert!((0.8..=1.2).contains(&delay));
    }

    #[test]
    fn attempt_counter_does_not_overflow() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        for _ in 0..100 {
            let delay = backoff.next_delay();
            assert!(delay <= Duration::from_secs(72));
        }
    }
}
