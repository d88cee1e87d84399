use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::Duration;

use crate::domain::{SessionRules, Timestamp};
use crate::ValidationError;

/// Sampling granularity of a fixed-cycle series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IntervalLevel {
    #[serde(rename = "tick")]
    Tick,
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[serde(rename = "30m")]
    ThirtyMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "4h")]
    FourHours,
    #[serde(rename = "1d")]
    OneDay,
    #[serde(rename = "1wk")]
    OneWeek,
    #[serde(rename = "1mon")]
    OneMonth,
}

/// Result of [`IntervalLevel::count_from`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodCount {
    /// Time until the period after the touching timestamp closes.
    pub wait: Duration,
    /// Whole periods that have closed since the touching timestamp.
    pub size: usize,
}

impl IntervalLevel {
    pub const ALL: [Self; 10] = [
        Self::Tick,
        Self::OneMinute,
        Self::FiveMinutes,
        Self::FifteenMinutes,
        Self::ThirtyMinutes,
        Self::OneHour,
        Self::FourHours,
        Self::OneDay,
        Self::OneWeek,
        Self::OneMonth,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tick => "tick",
            Self::OneMinute => "1m",
            Self::FiveMinutes => "5m",
            Self::FifteenMinutes => "15m",
            Self::ThirtyMinutes => "30m",
            Self::OneHour => "1h",
            Self::FourHours => "4h",
            Self::OneDay => "1d",
            Self::OneWeek => "1wk",
            Self::OneMonth => "1mon",
        }
    }

    /// Period length in seconds. Ticks have no fixed period.
    pub const fn seconds(self) -> Option<i64> {
        match self {
            Self::Tick => None,
            Self::OneMinute => Some(60),
            Self::FiveMinutes => Some(5 * 60),
            Self::FifteenMinutes => Some(15 * 60),
            Self::ThirtyMinutes => Some(30 * 60),
            Self::OneHour => Some(60 * 60),
            Self::FourHours => Some(4 * 60 * 60),
            Self::OneDay => Some(24 * 60 * 60),
            Self::OneWeek => Some(7 * 24 * 60 * 60),
            Self::OneMonth => Some(30 * 24 * 60 * 60),
        }
    }

    pub fn period(self) -> Option<Duration> {
        self.seconds().map(Duration::seconds)
    }

    pub const fn is_daily_or_coarser(self) -> bool {
        matches!(self, Self::OneDay | Self::OneWeek | Self::OneMonth)
    }

    /// Periods available between `touching` and `now` (both exchange wall
    /// times). Within one calendar day the count is capped at one trading
    /// day's worth; across days it is `(days + 1) * trading_seconds / period + 1`.
    pub fn count_from(self, touching: Timestamp, now: Timestamp, rules: &SessionRules) -> PeriodCount {
        let Some(period) = self.seconds().filter(|seconds| *seconds > 0) else {
            return PeriodCount {
                wait: Duration::ZERO,
                size: 0,
            };
        };

        let elapsed = now.into_inner() - touching.into_inner();
        let elapsed_seconds = elapsed.whole_seconds().max(0);
        let wait = if elapsed_seconds < period {
            Duration::seconds(period - elapsed_seconds)
        } else {
            Duration::ZERO
        };

        let trading_seconds = rules.trading_seconds();
        let size = if elapsed.whole_days() > 0 {
            (elapsed.whole_days() + 1) * trading_seconds / period + 1
        } else {
            (elapsed_seconds / period).min(trading_seconds / period)
        };

        PeriodCount {
            wait,
            size: usize::try_from(size).unwrap_or(0),
        }
    }
}

impl Display for IntervalLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntervalLevel {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|level| level.as_str() == normalized)
            .ok_or(ValidationError::InvalidLevel {
                value: value.trim().to_owned(),
            })
    }
}
