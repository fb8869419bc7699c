use std::collections::VecDeque;
use std::time::{Duration, Instant};

const MESSAGE_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allow,
    /// Over the limit: drop this message, keep the connection
    Drop,
    /// Too many violations inside the violation window
    Disconnect,
}

/// Sliding-window limiter for one connection's inbound messages.
#[derive(Debug)]
pub struct InboundRateLimiter {
    max_per_second: usize,
    timestamps: VecDeque<Instant>,
    max_violations: usize,
    violation_window: Duration,
    violations: VecDeque<Instant>,
}

impl InboundRateLimiter {
    pub fn new(max_per_second: usize, max_violations: usize, violation_window: Duration) -> Self {
        InboundRateLimiter {
            max_per_second: max_per_second.max(1),
            timestamps: VecDeque::new(),
            max_violations,
            violation_window,
            violations: VecDeque::new(),
        }
    }

    pub fn check(&mut self, now: Instant) -> RateDecision {
        evict(&mut self.timestamps, now, MESSAGE_WINDOW);

        if self.timestamps.len() < self.max_per_second {
            self.timestamps.push_back(now);
            return RateDecision::Allow;
        }

        evict(&mut self.violations, now, self.violation_window);
        self.violations.push_back(now);

        if self.violations.len() > self.max_violations {
            RateDecision::Disconnect
        } else {
            RateDecision::Drop
        }
    }

    pub fn violations(&self) -> usize {
        self.violations.len()
    }
}

fn evict(times: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(&front) = times.front() {
        if now.saturating_duration_since(front) >= window {
            times.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_over_limit_is_dropped_not_disconnected() {
        let mut limiter = InboundRateLimiter::new(10, 500, Duration::from_secs(60));
        let now = Instant::now();

        let decisions: Vec<RateDecision> = (0..100)
            .map(|i| limiter.check(now + Duration::from_millis(i * 5)))
            .collect();

        let allowed = decisions.iter().filter(|d| **d == RateDecision::Allow).count();
        assert_eq!(allowed, 10);
        assert!(decisions.iter().all(|d| *d != RateDecision::Disconnect));
        assert_eq!(limiter.violations(), 90);
    }

    #[test]
    fn test_window_slides() {
        let mut limiter = InboundRateLimiter::new(2, 500, Duration::from_secs(60));
        let start = Instant::now();

        assert_eq!(limiter.check(start), RateDecision::Allow);
        assert_eq!(limiter.check(start + Duration::from_millis(500)), RateDecision::Allow);
        assert_eq!(limiter.check(start + Duration::from_millis(900)), RateDecision::Drop);
        assert_eq!(limiter.check(start + Duration::from_millis(1000)), RateDecision::Allow);
    }

    #[test]
    fn test_disconnects_after_too_many_violations() {
        let mut limiter = InboundRateLimiter::new(1, 3, Duration::from_secs(60));
        let now = Instant::now();

        assert_eq!(limiter.check(now), RateDecision::Allow);
        for _ in 0..3 {
            assert_eq!(limiter.check(now), RateDecision::Drop);
        }
        assert_eq!(limiter.check(now), RateDecision::Disconnect);
    }

    #[test]
    fn test_old_violations_expire() {
        let mut limiter = InboundRateLimiter::new(1, 2, Duration::from_secs(60));
        let start = Instant::now();

        limiter.check(start);
        limiter.check(start);
        limiter.check(start);
        assert_eq!(limiter.violations(), 2);

        let later = start + Duration::from_secs(61);
        limiter.check(later);
        assert_eq!(limiter.check(later), RateDecision::Drop);
        assert_eq!(limiter.violations(), 1);
    }
}
