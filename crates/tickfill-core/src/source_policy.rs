use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::retry::RetryPolicy;

/// Request budget and resilience settings for one HTTP data source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourcePolicy {
    pub name: String,
    pub quota_window: Duration,
    pub quota_limit: u32,
    pub request_timeout: Duration,
    /// Largest `size` a single request may ask for.
    pub max_size: usize,
    pub retry: RetryPolicy,
    pub breaker: CircuitBreakerConfig,
}

impl SourcePolicy {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            quota_window: Duration::from_secs(60),
            quota_limit: 60,
            request_timeout: Duration::from_secs(10),
            max_size: 8000,
            retry: RetryPolicy::default(),
            breaker: CircuitBreakerConfig::default(),
        }
    }

    #[must_use]
    pub fn with_quota(mut self, limit: u32, window: Duration) -> Self {
        self.quota_limit = limit;
        self.quota_window = window;
        self
    }

    #[must_use]
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Spacing between requests when the budget is spread evenly.
    pub fn request_interval(&self) -> Duration {
        let limit = self.quota_limit.max(1);
        Duration::from_secs_f64((self.quota_window.as_secs_f64() / f64::from(limit)).max(0.001))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cap_requests_at_eight_thousand_rows() {
        let policy = SourcePolicy::new("kline");
        assert_eq!(policy.max_size, 8000);
        assert_eq!(policy.request_interval(), Duration::from_secs(1));
    }

    #[test]
    fn zero_quota_is_treated_as_one() {
        let policy = SourcePolicy::new("kline").with_quota(0, Duration::from_secs(5));
        assert_eq!(policy.request_interval(), Duration::from_secs(5));
    }
}
