//! Rate limiting middleware using token bucket algorithm

use axum::{extract::Request, extract::State, middleware::Next, response::Response};
use fedq_common::config::RateLimitConfig;
use fedq_common::errors::AppError;
use governor::{
    clock::QuantaClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;

/// Process-wide limiter shared by every route
pub type GlobalRateLimiter = RateLimiter<NotKeyed, InMemoryState, QuantaClock>;

#[derive(Clone)]
pub struct RateLimit {
    limiter: Arc<GlobalRateLimiter>,
    requests_per_second: u32,
}

impl RateLimit {
    /// Zero rates are raised to one request per second
    pub fn new(requests_per_second: u32, burst: u32) -> Self {
        let rate = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(burst).unwrap_or(rate);
        let quota = Quota::per_second(rate).allow_burst(burst);

        Self {
            limiter: Arc::new(RateLimiter::direct(quota)),
            requests_per_second: rate.get(),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.requests_per_second, config.burst)
    }
}

/// Rejects requests once the bucket is empty
pub async fn rate_limit_middleware(
    State(rate_limit): State<RateLimit>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    match rate_limit.limiter.check() {
        Ok(_) => Ok(next.run(request).await),
        Err(_) => {
            tracing::warn!(path = %request.uri().path(), "Rate limit exceeded");
            Err(AppError::RateLimited {
                limit: rate_limit.requests_per_second,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_is_enforced() {
        let rate_limit = RateLimit::new(1, 2);
        assert!(rate_limit.limiter.check().is_ok());
        assert!(rate_limit.limiter.check().is_ok());
        assert!(rate_limit.limiter.check().is_err());
    }

    #[test]
    fn test_zero_rate_is_clamped() {
        let rate_limit = RateLimit::new(0, 0);
        assert_eq!(rate_limit.requests_per_second, 1);
        assert!(rate_limit.limiter.check().is_ok());
    }
}
