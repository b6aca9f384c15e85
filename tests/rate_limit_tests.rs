#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};
    use TaskBlaster::rate_limit::*;

    // Stamps are taken just after `acquire` returns, so they trail the real
    // grant time a little; shrink the window by that slack.
    const SLACK: Duration = Duration::from_millis(30);

    // Largest number of stamps inside any window that starts at one of them.
    fn max_in_any_window(stamps: &[Instant], window: Duration) -> usize {
        let window = window - SLACK;
        stamps
            .iter()
            .map(|start| {
                stamps
                    .iter()
                    .filter(|t| **t >= *start && t.duration_since(*start) < window)
                    .count()
            })
            .max()
            .unwrap_or(0)
    }

    #[test]
    fn test_try_acquire_without_waiting() {
        let limiter =
            RateLimiter::new(RateLimitConfig::token_bucket(2, Duration::from_secs(1))).unwrap();
        let granted: Vec<bool> = (0..3).map(|_| limiter.try_acquire()).collect();
        assert_eq!(granted, vec![true, true, false]);
    }

    #[test]
    fn test_fixed_window_spreads_acquisitions() {
        let limiter =
            RateLimiter::new(RateLimitConfig::fixed_window(3, Duration::from_secs(1))).unwrap();
        let started = Instant::now();
        let mut stamps = Vec::new();
        for _ in 0..10 {
            limiter.acquire();
            stamps.push(Instant::now());
        }
        let elapsed = started.elapsed();

        assert!(
            elapsed >= Duration::from_secs(3),
            "10 permits at 3/s finished in {:?}",
            elapsed
        );
        assert!(max_in_any_window(&stamps, Duration::from_secs(1)) <= 3);
    }

    #[test]
    fn test_token_bucket_refills_at_rate() {
        let limiter = RateLimiter::new(
            RateLimitConfig::token_bucket(10, Duration::from_secs(1)).with_capacity(1),
        )
        .unwrap();
        let started = Instant::now();
        for _ in 0..5 {
            limiter.acquire();
        }
        // First permit is immediate, the remaining four wait ~100ms each.
        assert!(started.elapsed() >= Duration::from_millis(390));
    }

    #[test]
    fn test_threads_share_one_limiter() {
        let limiter = Arc::new(
            RateLimiter::new(RateLimitConfig::fixed_window(4, Duration::from_millis(400))).unwrap(),
        );
        let stamps = Arc::new(Mutex::new(Vec::new()));
        let started = Instant::now();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let stamps = Arc::clone(&stamps);
                std::thread::spawn(move || {
                    for _ in 0..3 {
                        limiter.acquire();
                        let at = Instant::now();
                        stamps.lock().unwrap().push(at);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stamps = stamps.lock().unwrap();
        assert_eq!(stamps.len(), 12);
        assert!(started.elapsed() >= Duration::from_millis(800));
        assert!(max_in_any_window(&stamps, Duration::from_millis(400)) <= 4);
    }

    #[test]
    fn test_rate_limited_wrapper() {
        let limiter = Arc::new(
            RateLimiter::new(RateLimitConfig::fixed_window(2, Duration::from_millis(300))).unwrap(),
        );
        let double = rate_limited(limiter, |x: u32| x * 2);
        let started = Instant::now();
        let out: Vec<u32> = (1..=5).map(&double).collect();
        assert_eq!(out, vec![2, 4, 6, 8, 10]);
        assert!(started.elapsed() >= Duration::from_millis(600));
    }

    #[tokio::test]
    async fn test_async_limiter_suspends_tasks() {
        let limiter = Arc::new(
            AsyncRateLimiter::new(RateLimitConfig::fixed_window(3, Duration::from_millis(500)))
                .unwrap(),
        );
        let started = Instant::now();
        let tasks: Vec<_> = (0..7)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move {
                    limiter.acquire().await;
                    Instant::now()
                })
            })
            .collect();
        let mut stamps = Vec::new();
        for task in tasks {
            stamps.push(task.await.unwrap());
        }
        assert!(started.elapsed() >= Duration::from_millis(1000));
        assert!(max_in_any_window(&stamps, Duration::from_millis(500)) <= 3);
    }

    #[tokio::test]
    async fn test_rate_limited_async_wrapper() {
        let limiter = Arc::new(
            AsyncRateLimiter::new(RateLimitConfig::token_bucket(1, Duration::from_millis(100)))
                .unwrap(),
        );
        let fetch = rate_limited_async(limiter, |x: u64| async move { x + 1 });
        let started = Instant::now();
        let mut total = 0;
        for i in 0..4 {
            total += fetch(i).await;
        }
        assert_eq!(total, 10);
        assert!(started.elapsed() >= Duration::from_millis(290));
    }

    #[test]
    fn test_invalid_configs_rejected() {
        assert!(RateLimiter::new(RateLimitConfig::token_bucket(0, Duration::from_secs(1))).is_err());
        assert!(RateLimiter::new(RateLimitConfig::fixed_window(1, Duration::ZERO)).is_err());
        assert!(AsyncRateLimiter::new(
            RateLimitConfig::token_bucket(5, Duration::from_secs(1)).with_capacity(0)
        )
        .is_err());
    }
}
