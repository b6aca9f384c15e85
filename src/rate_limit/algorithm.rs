//! Pure rate-limiting state machines. Callers pass `now` in so the
//! decision logic can be driven deterministically.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Result of one acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    Granted,
    /// No permit now; retry after at least this long.
    Wait(Duration),
}

#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    /// Tokens added per second (`rate / per`).
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Starts full so an initial burst of `capacity` is allowed.
    pub fn new(rate: u32, per: Duration, capacity: u32, now: Instant) -> Self {
        TokenBucket {
            capacity: capacity as f64,
            refill_rate: rate as f64 / per.as_secs_f64(),
            tokens: capacity as f64,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
            self.last_refill = now;
        }
    }

    pub fn poll(&mut self, now: Instant) -> Decision {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Decision::Granted;
        }
        let missing = 1.0 - self.tokens;
        Decision::Wait(Duration::from_secs_f64(missing / self.refill_rate))
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }
}

/// Sliding log of acceptance timestamps over the trailing window.
#[derive(Debug)]
pub struct FixedWindow {
    limit: usize,
    window: Duration,
    accepted: VecDeque<Instant>,
}

impl FixedWindow {
    pub fn new(rate: u32, per: Duration) -> Self {
        FixedWindow {
            limit: rate as usize,
            window: per,
            accepted: VecDeque::with_capacity(rate as usize),
        }
    }

    fn evict(&mut self, now: Instant) {
        while let Some(oldest) = self.accepted.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                self.accepted.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn poll(&mut self, now: Instant) -> Decision {
        self.evict(now);
        if self.accepted.len() < self.limit {
            self.accepted.push_back(now);
            return Decision::Granted;
        }
        // Full: wait until the oldest acceptance leaves the window.
        match self.accepted.front() {
            Some(oldest) => {
                let expires = *oldest + self.window;
                Decision::Wait(expires.saturating_duration_since(now))
            }
            None => Decision::Wait(self.window),
        }
    }

    pub fn in_window(&self) -> usize {
        self.accepted.len()
    }
}
