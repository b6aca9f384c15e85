use serde::Deserialize;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::trace;

use super::algorithm::{Decision, FixedWindow, TokenBucket};
use crate::error::{ExecutorError, Result};
use crate::utils::prometheus_metrics::RATE_LIMIT_WAITS_TOTAL;

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    /// Smooth limiter; bursts up to `capacity`.
    #[default]
    TokenBucket,
    /// At most `rate` acceptances in any trailing `per` window.
    FixedWindow,
}

/// `rate` permits per `per_secs` seconds.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub algorithm: RateLimitAlgorithm,
    pub rate: u32,
    #[serde(default = "default_per_secs")]
    pub per_secs: f64,
    /// Token-bucket burst size; defaults to `rate`. Ignored by the fixed window.
    #[serde(default)]
    pub capacity: Option<u32>,
}

fn default_per_secs() -> f64 {
    1.0
}

impl RateLimitConfig {
    pub fn token_bucket(rate: u32, per: Duration) -> Self {
        RateLimitConfig {
            algorithm: RateLimitAlgorithm::TokenBucket,
            rate,
            per_secs: per.as_secs_f64(),
            capacity: None,
        }
    }

    pub fn fixed_window(rate: u32, per: Duration) -> Self {
        RateLimitConfig {
            algorithm: RateLimitAlgorithm::FixedWindow,
            rate,
            per_secs: per.as_secs_f64(),
            capacity: None,
        }
    }

    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.rate == 0 {
            return Err(ExecutorError::ConfigError(
                "RateLimitConfig: rate must be greater than 0".to_string(),
            ));
        }
        if !self.per_secs.is_finite() || self.per_secs <= 0.0 {
            return Err(ExecutorError::ConfigError(format!(
                "RateLimitConfig: per_secs must be a positive number, got {}",
                self.per_secs
            )));
        }
        if self.capacity == Some(0) {
            return Err(ExecutorError::ConfigError(
                "RateLimitConfig: capacity must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    fn per(&self) -> Duration {
        Duration::from_secs_f64(self.per_secs)
    }

    fn build_state(&self) -> LimiterState {
        match self.algorithm {
            RateLimitAlgorithm::TokenBucket => LimiterState::TokenBucket(TokenBucket::new(
                self.rate,
                self.per(),
                self.capacity.unwrap_or(self.rate),
                Instant::now(),
            )),
            RateLimitAlgorithm::FixedWindow => {
                LimiterState::FixedWindow(FixedWindow::new(self.rate, self.per()))
            }
        }
    }
}

#[derive(Debug)]
enum LimiterState {
    TokenBucket(TokenBucket),
    FixedWindow(FixedWindow),
}

impl LimiterState {
    fn poll(&mut self, now: Instant) -> Decision {
        match self {
            LimiterState::TokenBucket(bucket) => bucket.poll(now),
            LimiterState::FixedWindow(window) => window.poll(now),
        }
    }
}

/// Rate limiter for threads. `acquire` parks the calling thread.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Result<Self> {
        config.validate()?;
        let state = Mutex::new(config.build_state());
        Ok(RateLimiter { config, state })
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn poll(&self) -> Decision {
        // The state is plain numbers; a poisoned lock is still consistent.
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.poll(Instant::now())
    }

    /// Blocks until a permit is granted. Woken waiters race for the refill,
    /// so this loops rather than trusting a single retry.
    pub fn acquire(&self) {
        loop {
            match self.poll() {
                Decision::Granted => return,
                Decision::Wait(wait) => {
                    trace!(wait_ms = wait.as_millis() as u64, "rate limiter waiting");
                    RATE_LIMIT_WAITS_TOTAL.inc();
                    std::thread::sleep(wait);
                }
            }
        }
    }

    pub fn try_acquire(&self) -> bool {
        matches!(self.poll(), Decision::Granted)
    }
}

/// Rate limiter for tasks on a cooperative scheduler. Waiting suspends the
/// task instead of blocking the runtime thread.
#[derive(Debug)]
pub struct AsyncRateLimiter {
    config: RateLimitConfig,
    state: tokio::sync::Mutex<LimiterState>,
}

impl AsyncRateLimiter {
    pub fn new(config: RateLimitConfig) -> Result<Self> {
        config.validate()?;
        let state = tokio::sync::Mutex::new(config.build_state());
        Ok(AsyncRateLimiter { config, state })
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub async fn acquire(&self) {
        loop {
            let decision = {
                let mut state = self.state.lock().await;
                state.poll(Instant::now())
            };
            match decision {
                Decision::Granted => return,
                Decision::Wait(wait) => {
                    trace!(wait_ms = wait.as_millis() as u64, "async rate limiter waiting");
                    RATE_LIMIT_WAITS_TOTAL.inc();
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Returns `false` without waiting when no permit is available or the
    /// limiter is momentarily held by another task.
    pub fn try_acquire(&self) -> bool {
        match self.state.try_lock() {
            Ok(mut state) => matches!(state.poll(Instant::now()), Decision::Granted),
            Err(_) => false,
        }
    }
}
