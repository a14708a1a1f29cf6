//! Monotonic one-shot timer used by the protocol state machines.

use std::time::{Duration, Instant};

/// A restartable deadline timer over monotonic time.
///
/// A stopped timer never reports a timeout. A running timer with a zero
/// timeout is immediately timed out.
#[derive(Debug, Clone)]
pub struct Timer {
    timeout: Duration,
    start_time: Option<Instant>,
}

impl Timer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            start_time: None,
        }
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn start(&mut self) {
        self.start_time = Some(Instant::now());
    }

    pub fn restart(&mut self, timeout: Duration) {
        self.set_timeout(timeout);
        self.start();
    }

    pub fn stop(&mut self) {
        self.start_time = None;
    }

    pub fn elapsed(&self) -> Duration {
        match self.start_time {
            Some(t) => t.elapsed(),
            None => Duration::ZERO,
        }
    }

    /// Time left before expiry. Zero when stopped or already expired.
    pub fn remaining(&self) -> Duration {
        match self.start_time {
            Some(t) => self.timeout.saturating_sub(t.elapsed()),
            None => Duration::ZERO,
        }
    }

    pub fn is_timed_out(&self) -> bool {
        match self.start_time {
            Some(t) => t.elapsed() > self.timeout || self.timeout.is_zero(),
            None => false,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.start_time.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stopped_timer_never_times_out() {
        let timer = Timer::new(Duration::ZERO);
        assert!(timer.is_stopped());
        assert!(!timer.is_timed_out());
        assert_eq!(timer.remaining(), Duration::ZERO);
    }

    #[test]
    fn zero_timeout_expires_immediately() {
        let mut timer = Timer::new(Duration::ZERO);
        timer.start();
        assert!(timer.is_timed_out());
    }

    #[test]
    fn running_timer_expires_after_timeout() {
        let mut timer = Timer::new(Duration::from_millis(20));
        timer.start();
        assert!(!timer.is_timed_out());
        std::thread::sleep(Duration::from_millis(30));
        assert!(timer.is_timed_out());
        timer.stop();
        assert!(!timer.is_timed_out());
    }
}
