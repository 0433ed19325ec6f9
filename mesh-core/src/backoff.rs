//! Exponential backoff with jitter.
//!
//! Used for hosted-relay retries inside a routing tier and for discovery
//! polling. Delays double from `base` up to `cap`, plus random jitter of up
//! to half the delay so many nodes retrying at once spread out.
//! A successful call resets the sequence.

use std::time::Duration;

/// Default first delay (500 ms).
pub const DEFAULT_BASE: Duration = Duration::from_millis(500);

/// Default ceiling (30 s).
pub const DEFAULT_CAP: Duration = Duration::from_secs(30);

/// Backoff sequence state.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    jitter: bool,
    attempt: u32,
}

impl Backoff {
    /// Create a backoff with jitter.
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            jitter: true,
            attempt: 0,
        }
    }

    /// Same schedule without the random component.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before the next retry; advances the sequence.
    ///
    /// Formula: min(cap, base · 2^attempt) + random(0..=delay/2), capped at `cap`.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32 << self.attempt.min(16);
        let delay = self.base.saturating_mul(factor).min(self.cap);
        self.attempt = self.attempt.saturating_add(1);

        if !self.jitter {
            return delay;
        }
        let spread = delay.as_millis() as u64 / 2;
        let jitter = Duration::from_millis(random_below(spread + 1));
        (delay + jitter).min(self.cap)
    }

    /// Start over after a success.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE, DEFAULT_CAP)
    }
}

/// Uniform-ish random value in `0..bound`; zero if the OS RNG is unavailable.
fn random_below(bound: u64) -> u64 {
    if bound == 0 {
        return 0;
    }
    let mut bytes = [0u8; 8];
    match getrandom::getrandom(&mut bytes) {
        Ok(()) => u64::from_le_bytes(bytes) % bound,
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_cap() {
        let mut backoff = Backoff::default().without_jitter();
        let delays: Vec<u64> = (0..9).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(
            delays,
            vec![500, 1000, 2000, 4000, 8000, 16000, 30000, 30000, 30000]
        );
    }

    #[test]
    fn reset_starts_over() {
        let mut backoff = Backoff::default().without_jitter();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        for _ in 0..100 {
            let mut backoff = Backoff::default();
            backoff.next_delay();
            let second = backoff.next_delay();
            assert!(second >= Duration::from_millis(1000));
            assert!(second <= Duration::from_millis(1500));
        }
    }

    #[test]
    fn jitter_has_variance() {
        let delays: Vec<Duration> = (0..20)
            .map(|_| {
                let mut b = Backoff::new(Duration::from_secs(10), DEFAULT_CAP);
                b.next_delay()
            })
            .collect();
        let first = delays[0];
        assert!(delays.iter().any(|d| *d != first), "jitter should vary");
    }

    #[test]
    fn never_exceeds_cap() {
        let mut backoff = Backoff::default();
        for _ in 0..50 {
            assert!(backoff.next_delay() <= DEFAULT_CAP);
        }
    }
}
