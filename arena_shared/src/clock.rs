//! Monotone process clock and fixed-length time periods.
//!
//! Every timing decision in the transport (send periods, resend deadlines,
//! loss deadlines, connect timeout, time-request cadence) is expressed as a
//! [`TimePeriod`] checked against an `f32` second count produced by one
//! [`GameClock`] per process. Time values are passed into the transport
//! explicitly, which keeps the deadline logic free of ambient state and
//! trivially testable.

use std::time::Instant;

/// Monotone system time source, in seconds since construction.
#[derive(Debug, Clone)]
pub struct GameClock {
    epoch: Instant,
}

impl GameClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Seconds elapsed since the clock was created. Never decreases.
    pub fn now(&self) -> f32 {
        self.epoch.elapsed().as_secs_f32()
    }
}

impl Default for GameClock {
    fn default() -> Self {
        Self::new()
    }
}

/// A fixed-length period with an expiry deadline.
#[derive(Debug, Clone, Copy)]
pub struct TimePeriod {
    length: f32,
    deadline: f32,
}

impl TimePeriod {
    /// Starts a period of `length` seconds at `now`.
    pub fn new(length: f32, now: f32) -> Self {
        Self {
            length,
            deadline: now + length,
        }
    }

    pub fn has_expired(&self, now: f32) -> bool {
        now >= self.deadline
    }

    /// Restarts the period with its current length.
    pub fn reset(&mut self, now: f32) {
        self.deadline = now + self.length;
    }

    /// Restarts the period with a new length.
    pub fn reset_with(&mut self, length: f32, now: f32) {
        self.length = length;
        self.deadline = now + length;
    }

    pub fn length(&self) -> f32 {
        self.length
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_monotone() {
        let clock = GameClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn period_expires_and_resets() {
        let mut period = TimePeriod::new(0.05, 1.0);
        assert!(!period.has_expired(1.04));
        assert!(period.has_expired(1.05));
        assert!(period.has_expired(2.0));

        period.reset(2.0);
        assert!(!period.has_expired(2.04));
        assert!(period.has_expired(2.05));
    }

    #[test]
    fn period_reset_with_changes_length() {
        let mut period = TimePeriod::new(0.05, 0.0);
        period.reset_with(1.5, 10.0);
        assert_eq!(period.length(), 1.5);
        assert!(!period.has_expired(11.4));
        assert!(period.has_expired(11.5));
    }
}
