//! Capped exponential reconnect backoff.

use std::time::Duration;

/// Computes the delay before reconnect attempt *n*:
/// `min(base · 2^(n−1), max)`, with attempts numbered from 1.
///
/// The struct is pure; the attempt counter lives in the connection loop and
/// is reset to zero only on a successful connection.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectBackoff {
    base: Duration,
    max: Duration,
}

impl ReconnectBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before attempt number `attempt` (1-based).  `attempt == 0` is
    /// treated as 1 so a miscounted caller waits the base delay instead of
    /// hammering the endpoint.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        let delay = self.base.as_secs_f64() * 2f64.powi(exponent as i32);
        Duration::from_secs_f64(delay.min(self.max.as_secs_f64()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_from_base() {
        let backoff = ReconnectBackoff::new(Duration::from_secs(1), Duration::from_secs(16));
        let delays: Vec<f64> = (1..=4).map(|n| backoff.delay(n).as_secs_f64()).collect();
        assert_eq!(delays, vec![1.0, 2.0, 4.0, 8.0]);
    }

    #[test]
    fn caps_at_max() {
        let backoff = ReconnectBackoff::new(Duration::from_secs(1), Duration::from_secs(16));
        assert_eq!(backoff.delay(5).as_secs_f64(), 16.0);
        assert_eq!(backoff.delay(6).as_secs_f64(), 16.0);
        assert_eq!(backoff.delay(u32::MAX).as_secs_f64(), 16.0);
    }

    #[test]
    fn attempt_zero_waits_base_delay() {
        let backoff = ReconnectBackoff::new(Duration::from_secs(1), Duration::from_secs(16));
        assert_eq!(backoff.delay(0), backoff.delay(1));
    }

    #[test]
    fn fractional_base() {
        let backoff =
            ReconnectBackoff::new(Duration::from_secs_f64(0.5), Duration::from_secs(30));
        assert_eq!(backoff.delay(1).as_secs_f64(), 0.5);
        assert_eq!(backoff.delay(3).as_secs_f64(), 2.0);
    }
}
