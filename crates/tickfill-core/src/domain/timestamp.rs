use std::fmt::{Display, Formatter};

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::format_description::well_known::Rfc3339;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{Date, Duration, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};

use crate::TimestampParseError;

const DAY: &[FormatItem<'static>] = format_description!("[year]-[month]-[day]");
const COMPACT_DAY: &[FormatItem<'static>] = format_description!("[year][month][day]");
const SPACED: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second][optional [.[subsecond]]]");
const SPACED_MINUTE: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]");
const ISO_NAIVE: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second][optional [.[subsecond]]]");
const ISO_SECONDS: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
const ISO_MILLIS: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]");
const STORE: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:6]");

/// Epoch values above this are read as milliseconds.
const EPOCH_MILLIS_THRESHOLD: i64 = 100_000_000_000;

/// Wall-clock time of a record in its exchange's local calendar.
///
/// Inputs that carry an offset (RFC3339, epoch values) are converted to the
/// exchange offset; naive inputs are taken as already local.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(PrimitiveDateTime);

impl Timestamp {
    pub const fn new(value: PrimitiveDateTime) -> Self {
        Self(value)
    }

    pub const fn from_date(date: Date) -> Self {
        Self(PrimitiveDateTime::new(date, Time::MIDNIGHT))
    }

    /// Local wall time of `instant` at `offset`.
    pub fn from_instant(instant: OffsetDateTime, offset: UtcOffset) -> Self {
        let local = instant.to_offset(offset);
        Self(PrimitiveDateTime::new(local.date(), local.time()))
    }

    pub fn from_epoch(value: i64, offset: UtcOffset) -> Result<Self, TimestampParseError> {
        let nanos = if value.abs() >= EPOCH_MILLIS_THRESHOLD {
            i128::from(value) * 1_000_000
        } else {
            i128::from(value) * 1_000_000_000
        };
        OffsetDateTime::from_unix_timestamp_nanos(nanos)
            .map(|instant| Self::from_instant(instant, offset))
            .map_err(|_| TimestampParseError {
                value: value.to_string(),
            })
    }

    /// Parse any of the accepted textual forms: RFC3339, `YYYY-MM-DD`,
    /// `YYYYMMDD`, `YYYY-MM-DD HH:MM[:SS[.fff]]`, `YYYY-MM-DDTHH:MM:SS[.fff]`,
    /// or epoch seconds/milliseconds.
    pub fn parse(input: &str, offset: UtcOffset) -> Result<Self, TimestampParseError> {
        let value = input.trim();
        let error = || TimestampParseError {
            value: input.to_owned(),
        };
        if value.is_empty() {
            return Err(error());
        }

        if let Ok(instant) = OffsetDateTime::parse(value, &Rfc3339) {
            return Ok(Self::from_instant(instant, offset));
        }
        for format in [SPACED, ISO_NAIVE, SPACED_MINUTE] {
            if let Ok(parsed) = PrimitiveDateTime::parse(value, format) {
                return Ok(Self(parsed));
            }
        }
        if let Ok(date) = Date::parse(value, DAY) {
            return Ok(Self::from_date(date));
        }
        if value.len() == 8 {
            if let Ok(date) = Date::parse(value, COMPACT_DAY) {
                return Ok(Self::from_date(date));
            }
        }
        if value.len() >= 9 && value.bytes().all(|byte| byte.is_ascii_digit()) {
            let epoch = value.parse::<i64>().map_err(|_| error())?;
            return Self::from_epoch(epoch, offset);
        }

        Err(error())
    }

    /// Parse a naive textual form; offsets in the input are applied as UTC.
    pub fn parse_naive(input: &str) -> Result<Self, TimestampParseError> {
        Self::parse(input, UtcOffset::UTC)
    }

    pub const fn date(self) -> Date {
        self.0.date()
    }

    pub const fn time(self) -> Time {
        self.0.time()
    }

    pub const fn into_inner(self) -> PrimitiveDateTime {
        self.0
    }

    pub fn checked_add(self, duration: Duration) -> Option<Self> {
        self.0.checked_add(duration).map(Self)
    }

    pub fn is_midnight(self) -> bool {
        self.0.time() == Time::MIDNIGHT
    }

    /// `YYYY-MM-DD`.
    pub fn format_day(self) -> String {
        self.0
            .date()
            .format(DAY)
            .unwrap_or_else(|_| self.0.date().to_string())
    }

    /// `YYYY-MM-DDTHH:MM:SS`, with `.fff` when the millisecond part is non-zero.
    pub fn format_precise(self) -> String {
        let format = if self.0.millisecond() == 0 {
            ISO_SECONDS
        } else {
            ISO_MILLIS
        };
        self.0.format(format).unwrap_or_else(|_| self.0.to_string())
    }

    /// `YYYY-MM-DD HH:MM:SS.ffffff`, the form the warehouse binds and returns.
    pub fn format_store(self) -> String {
        self.0.format(STORE).unwrap_or_else(|_| self.0.to_string())
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.format_precise())
    }
}

impl From<Date> for Timestamp {
    fn from(value: Date) -> Self {
        Self::from_date(value)
    }
}

impl Serialize for Timestamp {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.format_precise())
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Self::parse_naive(&value).map_err(D::Error::custom)
    }
}
