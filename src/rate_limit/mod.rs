// Rate limiting

pub mod algorithm;
pub mod limiter;

pub use algorithm::{Decision, FixedWindow, TokenBucket};
pub use limiter::{AsyncRateLimiter, RateLimitAlgorithm, RateLimitConfig, RateLimiter};

use futures::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::sync::Arc;

/// Wraps a synchronous callable so every call first takes a permit.
pub fn rate_limited<T, R, F>(limiter: Arc<RateLimiter>, f: F) -> impl Fn(T) -> R + Send + Sync + 'static
where
    F: Fn(T) -> R + Send + Sync + 'static,
{
    move |input| {
        limiter.acquire();
        f(input)
    }
}

/// Async counterpart of [`rate_limited`]; the permit is awaited before the
/// wrapped future is polled.
pub fn rate_limited_async<T, R, F, Fut>(
    limiter: Arc<AsyncRateLimiter>,
    f: F,
) -> impl Fn(T) -> BoxFuture<'static, R> + Send + Sync + 'static
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    T: Send + 'static,
{
    let f = Arc::new(f);
    move |input| {
        let limiter = Arc::clone(&limiter);
        let f = Arc::clone(&f);
        async move {
            limiter.acquire().await;
            f(input).await
        }
        .boxed()
    }
}
