use std::time::Duration;

use tokio::time::Instant;

/// Burst limiter: up to `burst` operations per window; the allowance refills
/// in full once `refill` has passed since the window opened.
#[derive(Debug, Clone)]
pub struct BurstLimiter {
    burst: u32,
    refill: Duration,
    remaining: u32,
    window_start: Instant,
}

impl BurstLimiter {
    pub fn new(burst: u32, refill: Duration) -> Self {
        Self {
            burst,
            refill,
            remaining: burst,
            window_start: Instant::now(),
        }
    }

    pub fn try_acquire(&mut self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&mut self, now: Instant) -> bool {
        if now.duration_since(self.window_start) >= self.refill {
            self.remaining = self.burst;
            self.window_start = now;
        }
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }
}
