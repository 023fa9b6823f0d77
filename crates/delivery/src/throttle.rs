//! Send throttle — keeps the per-second mailer call rate under the
//! provider limit.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};

pub struct SendThrottle {
    max_per_second: u64,
    counter: AtomicU64,
    last_reset: std::sync::Mutex<DateTime<Utc>>,
}

impl SendThrottle {
    pub fn new(max_per_second: u64) -> Self {
        Self {
            max_per_second,
            counter: AtomicU64::new(0),
            last_reset: std::sync::Mutex::new(Utc::now()),
        }
    }

    /// Claims one send slot in the current window. `false` means the caller
    /// should treat the attempt as a transient failure and retry later.
    pub fn try_acquire(&self) -> bool {
        self.maybe_reset();
        let taken = self.counter.fetch_add(1, Ordering::Relaxed);
        if taken >= self.max_per_second {
            self.counter.fetch_sub(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    pub fn current_rate(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }

    fn maybe_reset(&self) {
        let now = Utc::now();
        if let Ok(mut last) = self.last_reset.lock() {
            if (now - *last).num_seconds() >= 1 {
                self.counter.store(0, Ordering::Relaxed);
                *last = now;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_refuses_past_the_limit() {
        let throttle = SendThrottle::new(3);
        assert!(throttle.try_acquire());
        assert!(throttle.try_acquire());
        assert!(throttle.try_acquire());
        assert!(!throttle.try_acquire());
        assert_eq!(throttle.current_rate(), 3);
    }
}
