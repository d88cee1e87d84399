//! Retry schedule for HTTP source calls.

use std::time::Duration;

/// Delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Fixed(Duration),
    /// `base * factor^attempt`, capped at `max`, optionally jittered by ±50%.
    Exponential {
        base: Duration,
        factor: f64,
        max: Duration,
        jitter: bool,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_millis(200),
            factor: 2.0,
            max: Duration::from_secs(3),
            jitter: true,
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay(self, attempt: u32) -> Duration {
        match self {
            Self::Fixed(delay) => delay,
            Self::Exponential {
                base,
                factor,
                max,
                jitter,
            } => {
                let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
                let seconds = (base.as_secs_f64() * factor.powi(exponent)).min(max.as_secs_f64());
                let delay = Duration::from_secs_f64(seconds.max(0.0));
                if jitter {
                    jittered(delay)
                } else {
                    delay
                }
            }
        }
    }
}

fn jittered(delay: Duration) -> Duration {
    let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    let spread = millis / 2;
    let offset = fastrand::u64(0..=spread.saturating_mul(2));
    Duration::from_millis((millis - spread).saturating_add(offset))
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts are `max_retries + 1`.
    pub max_retries: u32,
    pub backoff: Backoff,
    pub retry_on_status: Vec<u16>,
    pub retry_on_transport: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            backoff: Backoff::default(),
            retry_on_status: vec![408, 429, 500, 502, 503, 504],
            retry_on_transport: true,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn fixed(delay: Duration, max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Fixed(delay),
            ..Self::default()
        }
    }

    pub fn retries_status(&self, status: u16) -> bool {
        self.retry_on_status.contains(&status)
    }

    /// `None` once `attempt` has used up the retry budget.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        (attempt < self.max_retries).then(|| self.backoff.delay(attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles_until_capped() {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(250),
            factor: 2.0,
            max: Duration::from_secs(1),
            jitter: false,
        };
        let delays = (0..4).map(|attempt| backoff.delay(attempt)).collect::<Vec<_>>();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(250),
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(1),
            ]
        );
    }

    #[test]
    fn jitter_stays_within_half_either_side() {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(400),
            factor: 1.0,
            max: Duration::from_secs(1),
            jitter: true,
        };
        for _ in 0..20 {
            let delay = backoff.delay(0);
            assert!(delay >= Duration::from_millis(200) && delay <= Duration::from_millis(600));
        }
    }

    #[test]
    fn retry_budget_is_exhausted_after_max_retries() {
        let policy = RetryPolicy::fixed(Duration::from_millis(10), 2);
        assert_eq!(policy.next_delay(0), Some(Duration::from_millis(10)));
        assert_eq!(policy.next_delay(1), Some(Duration::from_millis(10)));
        assert_eq!(policy.next_delay(2), None);
        assert!(RetryPolicy::none().next_delay(0).is_none());
    }

    #[test]
    fn default_policy_retries_throttling_and_server_errors() {
        let policy = RetryPolicy::default();
        assert!(policy.retries_status(429));
        assert!(policy.retries_status(503));
        assert!(!policy.retries_status(404));
    }
}
