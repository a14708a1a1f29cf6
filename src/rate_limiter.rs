//! Outbound bitrate cap over a sliding window of monotonic time.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Bursts closer together than this share one accounting bucket.
const TIME_SLOT_LENGTH: Duration = Duration::from_millis(5);

const NO_LIMIT: usize = 0xFFFF_FFFF;

/// Sliding-window token bucket limiting the mean outbound bitrate.
///
/// Only the CAN data field is counted; framing overhead is ignored.
#[derive(Debug)]
pub struct RateLimiter {
    enabled: bool,
    mean_bitrate: f64,
    window_size: Duration,
    bursts: VecDeque<(Instant, usize)>,
    bit_total: usize,
    window_bit_max: f64,
}

impl RateLimiter {
    pub fn new(mean_bitrate: f64, window_size: Duration) -> Self {
        Self {
            enabled: false,
            mean_bitrate,
            window_size,
            bursts: VecDeque::new(),
            bit_total: 0,
            window_bit_max: mean_bitrate * window_size.as_secs_f64(),
        }
    }

    pub fn enable(&mut self) {
        self.enabled = true;
        self.reset();
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn reset(&mut self) {
        self.bursts.clear();
        self.bit_total = 0;
        self.window_bit_max = self.mean_bitrate * self.window_size.as_secs_f64();
    }

    /// Drops accounting buckets that slid out of the window.
    pub fn update(&mut self) {
        if !self.enabled {
            self.reset();
            return;
        }
        let now = Instant::now();
        while let Some(&(t, bits)) = self.bursts.front() {
            if now.duration_since(t) > self.window_size {
                self.bursts.pop_front();
                self.bit_total -= bits;
            } else {
                break;
            }
        }
    }

    /// How many payload bytes may still be emitted inside the current window.
    pub fn allowed_bytes(&self) -> usize {
        if !self.enabled {
            return NO_LIMIT;
        }
        let allowed_bits = (self.window_bit_max - self.bit_total as f64).max(0.0);
        (allowed_bits / 8.0) as usize
    }

    /// Records `datalen` payload bytes as sent.
    pub fn inform_bytes_sent(&mut self, datalen: usize) {
        if !self.enabled {
            return;
        }
        let bits = datalen * 8;
        let now = Instant::now();
        self.bit_total += bits;
        match self.bursts.back_mut() {
            Some((t, count)) if now.duration_since(*t) <= TIME_SLOT_LENGTH => *count += bits,
            _ => self.bursts.push_back((now, bits)),
        }
    }

    /// Time until the oldest bucket leaves the window and frees room.
    /// `None` when nothing is queued against the limit.
    pub fn time_until_room(&self) -> Option<Duration> {
        if !self.enabled || self.bursts.is_empty() {
            return None;
        }
        let (t, _) = self.bursts.front().copied()?;
        Some(self.window_size.saturating_sub(t.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_limiter_allows_everything() {
        let limiter = RateLimiter::new(1000.0, Duration::from_millis(100));
        assert_eq!(limiter.allowed_bytes(), NO_LIMIT);
    }

    #[test]
    fn budget_shrinks_as_bytes_are_sent() {
        // 8000 bits over 1 s window -> 1000 bytes budget.
        let mut limiter = RateLimiter::new(8000.0, Duration::from_secs(1));
        limiter.enable();
        assert_eq!(limiter.allowed_bytes(), 1000);
        limiter.inform_bytes_sent(600);
        limiter.update();
        assert_eq!(limiter.allowed_bytes(), 400);
        limiter.inform_bytes_sent(400);
        limiter.update();
        assert_eq!(limiter.allowed_bytes(), 0);
    }

    #[test]
    fn budget_recovers_after_window_slides() {
        let mut limiter = RateLimiter::new(80_000.0, Duration::from_millis(50));
        limiter.enable();
        let budget = limiter.allowed_bytes();
        limiter.inform_bytes_sent(budget);
        limiter.update();
        assert_eq!(limiter.allowed_bytes(), 0);
        assert!(limiter.time_until_room().is_some());
        std::thread::sleep(Duration::from_millis(70));
        limiter.update();
        assert_eq!(limiter.allowed_bytes(), budget);
    }
}
