use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};

use crate::source_policy::SourcePolicy;

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Request budget of one source. Callers sleep for the returned delay when
/// the budget is spent.
#[derive(Clone)]
pub struct Throttle {
    limiter: Arc<DirectRateLimiter>,
    interval: Duration,
}

impl Throttle {
    pub fn new(quota_window: Duration, quota_limit: u32) -> Self {
        let burst = NonZeroU32::new(quota_limit.max(1)).unwrap_or(NonZeroU32::MIN);
        let interval =
            Duration::from_secs_f64((quota_window.as_secs_f64() / f64::from(burst.get())).max(0.001));
        let quota = Quota::with_period(interval)
            .unwrap_or_else(|| Quota::per_second(burst))
            .allow_burst(burst);
        Self {
            limiter: Arc::new(RateLimiter::direct(quota)),
            interval,
        }
    }

    pub fn from_policy(policy: &SourcePolicy) -> Self {
        Self::new(policy.quota_window, policy.quota_limit)
    }

    /// Take one request slot, or report how long to wait for the next one.
    pub fn acquire(&self) -> Result<(), Duration> {
        self.limiter.check().map_err(|_| self.interval)
    }

    /// Wait until a slot is free.
    pub async fn ready(&self) {
        while let Err(wait) = self.acquire() {
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spends_the_burst_then_asks_for_one_interval() {
        let throttle = Throttle::new(Duration::from_secs(60), 2);

        assert!(throttle.acquire().is_ok());
        assert!(throttle.acquire().is_ok());
        assert_eq!(throttle.acquire(), Err(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn ready_returns_immediately_with_budget() {
        let throttle = Throttle::new(Duration::from_secs(1), 5);
        throttle.ready().await;
        assert!(throttle.acquire().is_ok());
    }
}
