//! Backoff delays between content-fetch attempts
//!
//! Implements exponential backoff with optional jitter to avoid hammering a
//! remote that is already refusing content.

use crate::config::BackoffConfig;
use rand::Rng;
use std::time::Duration;

/// Tracks the growing delay across one page's attempt loop.
#[derive(Debug)]
pub(crate) struct Backoff<'a> {
    config: &'a BackoffConfig,
    delay: Duration,
}

impl<'a> Backoff<'a> {
    pub(crate) fn new(config: &'a BackoffConfig) -> Self {
        Self {
            config,
            delay: config.initial_delay,
        }
    }

    /// The delay to sleep before the next attempt. Grows exponentially,
    /// capped at the configured maximum.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let current = if self.config.jitter {
            add_jitter(self.delay)
        } else {
            self.delay
        };

        let grown = Duration::from_secs_f64(self.delay.as_secs_f64() * self.config.multiplier);
        self.delay = grown.min(self.config.max_delay);

        current
    }
}

/// Add random jitter to a delay to prevent thundering herd
///
/// Jitter is uniformly distributed between 0% and 100% of the delay, so the
/// actual delay lands between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn config_without_jitter() -> BackoffConfig {
        BackoffConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn delay_doubles_until_capped() {
        let config = config_without_jitter();
        let mut backoff = Backoff::new(&config);

        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        assert_eq!(
            backoff.next_delay(),
            Duration::from_millis(350),
            "delay must stay at the cap"
        );
    }

    #[test]
    fn jitter_stays_within_one_to_two_times_delay() {
        let base = Duration::from_millis(100);
        for _ in 0..50 {
            let jittered = add_jitter(base);
            assert!(jittered >= base, "jitter must never shorten the delay");
            assert!(
                jittered <= base * 2,
                "jitter must not exceed twice the delay, got {jittered:?}"
            );
        }
    }
}
