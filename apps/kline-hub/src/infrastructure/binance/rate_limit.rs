//! REST Request Budget
//!
//! Token bucket for the REST klines endpoint, built on `governor`'s GCRA
//! limiter. The bucket holds `requests_per_second` tokens and refills at
//! the same rate, so a burst after a long reconnect drains it and further
//! requests are spaced out evenly.

use std::num::NonZeroU32;
use std::sync::Arc;

use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Shared REST rate limiter.
#[derive(Clone)]
pub struct RestRateLimiter {
    limiter: Arc<DirectLimiter>,
    per_second: NonZeroU32,
}

impl RestRateLimiter {
    /// Allow `requests_per_second` requests per second (at least one).
    #[must_use]
    pub fn per_second(requests_per_second: u32) -> Self {
        let per_second = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            limiter: Arc::new(RateLimiter::direct(Quota::per_second(per_second))),
            per_second,
        }
    }

    /// Wait until a token is available and take it.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    /// Take a token if one is available right now.
    #[must_use]
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    /// Configured rate.
    #[must_use]
    pub const fn requests_per_second(&self) -> u32 {
        self.per_second.get()
    }
}

impl std::fmt::Debug for RestRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestRateLimiter")
            .field("per_second", &self.per_second)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_is_bounded_by_rate() {
        let limiter = RestRateLimiter::per_second(3);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn zero_rate_is_clamped() {
        let limiter = RestRateLimiter::per_second(0);
        assert_eq!(limiter.requests_per_second(), 1);
        assert!(limiter.try_acquire());
    }

    #[tokio::test]
    async fn clones_share_the_bucket() {
        let limiter = RestRateLimiter::per_second(1);
        let other = limiter.clone();
        limiter.acquire().await;
        assert!(!other.try_acquire());
    }
}
