//! Rate limiting utilities

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;

/// Rate limiter type alias
pub type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Create a rate limiter with the specified requests per second
pub fn create_limiter(requests_per_second: u32) -> Arc<Limiter> {
    let quota = Quota::per_second(NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN));
    Arc::new(RateLimiter::direct(quota))
}

/// Matchmaking join rate limit
pub const MATCHMAKING_RATE_LIMIT: u32 = 5; // Max 5 join attempts per second

/// Guards how often one client may start a queueing session
#[derive(Clone)]
pub struct JoinRateLimiter {
    limiter: Arc<Limiter>,
}

impl JoinRateLimiter {
    pub fn new(per_second: u32) -> Self {
        Self {
            limiter: create_limiter(per_second),
        }
    }

    /// Check if a join attempt is allowed (returns true if allowed)
    pub fn check_join(&self) -> bool {
        self.limiter.check().is_ok()
    }
}
