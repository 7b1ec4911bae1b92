//! Inbound rate limiting for position updates.
//!
//! Position updates are the one performance-critical message: clients
//! emit them on every input tick, and each accepted update fans out to
//! a whole map. The limiter enforces a minimum spacing between
//! *accepted* updates per connection; anything faster is dropped
//! silently, with no error reply, and the in-memory position keeps the
//! last accepted value.

use std::time::{Duration, Instant};

/// Minimum-interval throttle. The per-connection state (the instant of
/// the last accepted update) lives on the session; the limiter is just
/// the policy.
#[derive(Debug, Clone, Copy)]
pub struct UpdateLimiter {
    interval: Duration,
}

impl UpdateLimiter {
    /// Creates a limiter with the given minimum spacing.
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Whether an update arriving at `now` should be accepted, given
    /// when the connection's previous update was accepted.
    pub fn accepts(&self, last_accepted: Option<Instant>, now: Instant) -> bool {
        match last_accepted {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        }
    }

    /// The configured minimum spacing.
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

#[cfg(test)]
mod tests {
    //! Timing is injected as explicit instants so these tests never
    //! sleep.

    use super::*;

    #[test]
    fn test_accepts_first_update_always() {
        let limiter = UpdateLimiter::new(Duration::from_millis(66));
        assert!(limiter.accepts(None, Instant::now()));
    }

    #[test]
    fn test_accepts_update_at_exactly_the_interval() {
        let limiter = UpdateLimiter::new(Duration::from_millis(66));
        let t0 = Instant::now();
        assert!(limiter.accepts(Some(t0), t0 + Duration::from_millis(66)));
    }

    #[test]
    fn test_rejects_update_inside_the_interval() {
        let limiter = UpdateLimiter::new(Duration::from_millis(66));
        let t0 = Instant::now();
        assert!(!limiter.accepts(Some(t0), t0 + Duration::from_millis(10)));
    }

    #[test]
    fn test_zero_interval_accepts_everything() {
        let limiter = UpdateLimiter::new(Duration::ZERO);
        let t0 = Instant::now();
        assert!(limiter.accepts(Some(t0), t0));
    }

    #[test]
    fn test_burst_spacing_caps_accepted_count() {
        // 30 submissions over one second at a 66 ms interval: at most
        // ceil(1000 / 66) + 1 can be accepted.
        let limiter = UpdateLimiter::new(Duration::from_millis(66));
        let t0 = Instant::now();

        let mut last = None;
        let mut accepted = 0;
        for i in 0..30 {
            let now = t0 + Duration::from_millis(i * 33);
            if limiter.accepts(last, now) {
                last = Some(now);
                accepted += 1;
            }
        }

        assert!(accepted <= 16, "accepted {accepted} of 30");
        assert!(accepted >= 2, "limiter should not starve the stream");
    }
}
