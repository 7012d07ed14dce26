use std::cmp;
use std::time::{Duration, Instant};

const MAX_DOUBLINGS: u32 = 16;

/// Bounded exponential reconnect delay.
///
/// The n-th consecutive failure waits `min(base * 2^n, cap)`. A connection
/// that stayed up for at least `reset_after` counts as recovery and resets
/// the sequence; shorter connections are treated as blips and keep climbing.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    reset_after: Duration,
    failures: u32,
    connected_since: Option<Instant>,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, reset_after: Duration) -> Self {
        Self {
            base,
            cap: cmp::max(cap, base),
            reset_after,
            failures: 0,
            connected_since: None,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = compute_delay(self.base, self.cap, self.failures);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    pub fn on_connected(&mut self, now: Instant) {
        self.connected_since = Some(now);
    }

    pub fn on_disconnected(&mut self, now: Instant) {
        if let Some(since) = self.connected_since.take() {
            if now.saturating_duration_since(since) >= self.reset_after {
                self.failures = 0;
            }
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

fn compute_delay(base: Duration, cap: Duration, failures: u32) -> Duration {
    let factor = 1u32 << cmp::min(failures, MAX_DOUBLINGS);
    let delay = base.checked_mul(factor).unwrap_or(cap);
    cmp::min(delay, cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_backoff() -> Backoff {
        Backoff::new(
            Duration::from_secs(2),
            Duration::from_secs(60),
            Duration::from_secs(30),
        )
    }

    #[test]
    fn doubles_from_base() {
        let mut backoff = default_backoff();
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.next_delay(), Duration::from_secs(8));
        assert_eq!(backoff.failures(), 3);
    }

    #[test]
    fn delays_are_monotonic_and_capped() {
        let mut backoff = default_backoff();
        let mut previous = Duration::ZERO;
        for _ in 0..100 {
            let delay = backoff.next_delay();
            assert!(delay >= previous, "{delay:?} < {previous:?}");
            assert!(delay <= Duration::from_secs(60));
            previous = delay;
        }
        assert_eq!(previous, Duration::from_secs(60));
    }

    #[test]
    fn stable_connection_resets_sequence() {
        let mut backoff = default_backoff();
        backoff.next_delay();
        backoff.next_delay();

        let connected_at = Instant::now();
        backoff.on_connected(connected_at);
        backoff.on_disconnected(connected_at + Duration::from_secs(31));

        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
    }

    #[test]
    fn short_connection_keeps_climbing() {
        let mut backoff = default_backoff();
        backoff.next_delay();
        backoff.next_delay();

        let connected_at = Instant::now();
        backoff.on_connected(connected_at);
        backoff.on_disconnected(connected_at + Duration::from_secs(5));

        assert_eq!(backoff.next_delay(), Duration::from_secs(8));
    }

    #[test]
    fn cap_below_base_is_raised_to_base() {
        let mut backoff = Backoff::new(
            Duration::from_secs(5),
            Duration::from_secs(1),
            Duration::from_secs(30),
        );
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
    }
}
