use serde::Serialize;
use time::macros::{offset, time};
use time::{Duration, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};

use crate::domain::{Entity, EntityType, Timestamp};

/// Trading-session shape of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionRules {
    /// Offset of the exchange's local calendar from UTC.
    pub offset: UtcOffset,
    /// Local session close; `None` for markets that never close.
    pub close: Option<Time>,
    pub trading_minutes: i64,
}

impl SessionRules {
    /// Shanghai and Shenzhen listings.
    pub const fn china_equity() -> Self {
        Self {
            offset: offset!(+8),
            close: Some(time!(15:00)),
            trading_minutes: 240,
        }
    }

    /// NYSE and Nasdaq listings.
    pub const fn us_equity() -> Self {
        Self {
            offset: offset!(-5),
            close: Some(time!(16:00)),
            trading_minutes: 390,
        }
    }

    pub const fn always_open() -> Self {
        Self {
            offset: UtcOffset::UTC,
            close: None,
            trading_minutes: 24 * 60,
        }
    }

    pub fn for_entity(entity: &Entity) -> Self {
        if entity.entity_type == EntityType::Coin {
            return Self::always_open();
        }
        match entity.exchange.as_str() {
            "sh" | "sz" => Self::china_equity(),
            "nyse" | "nasdaq" | "us" => Self::us_equity(),
            _ => Self::always_open(),
        }
    }

    pub const fn trading_seconds(&self) -> i64 {
        self.trading_minutes * 60
    }

    pub const fn never_closes(&self) -> bool {
        self.close.is_none()
    }

    /// Wall-clock time at the exchange for the instant `now`.
    pub fn wall_clock(&self, now: OffsetDateTime) -> Timestamp {
        Timestamp::from_instant(now, self.offset)
    }

    /// Session close on the calendar day of `at`.
    pub fn close_on(&self, at: Timestamp) -> Option<Timestamp> {
        self.close
            .map(|close| Timestamp::new(PrimitiveDateTime::new(at.date(), close)))
    }

    /// True when `latest` is exactly the close of the same day as `now`.
    pub fn is_closing_bar(&self, latest: Timestamp, now: Timestamp) -> bool {
        latest.date() == now.date() && self.close.is_some_and(|close| latest.time() == close)
    }

    /// True when the session of `now`'s day has closed and `grace` has passed.
    /// Never-closing sessions are always open.
    pub fn has_settled(&self, now: Timestamp, grace: Duration) -> bool {
        self.close_on(now)
            .and_then(|close| close.checked_add(grace))
            .is_some_and(|settled_at| now >= settled_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn session_rules_follow_exchange() {
        let stock = Entity::parse_id("stock_sz_000338").expect("stock");
        let coin = Entity::parse_id("coin_binance_btc").expect("coin");
        let us = Entity::parse_id("stock_nasdaq_aapl").expect("us");

        assert_eq!(SessionRules::for_entity(&stock), SessionRules::china_equity());
        assert!(SessionRules::for_entity(&coin).never_closes());
        assert_eq!(SessionRules::for_entity(&us).trading_minutes, 390);
    }

    #[test]
    fn wall_clock_uses_exchange_offset() {
        let rules = SessionRules::china_equity();
        let wall = rules.wall_clock(datetime!(2020-01-05 20:00 UTC));
        assert_eq!(wall.into_inner(), datetime!(2020-01-06 04:00));
    }

    #[test]
    fn settles_after_close_plus_grace() {
        let rules = SessionRules::china_equity();
        let grace = Duration::minutes(2);
        assert!(!rules.has_settled(Timestamp::new(datetime!(2020-01-06 15:01)), grace));
        assert!(rules.has_settled(Timestamp::new(datetime!(2020-01-06 15:02)), grace));
        assert!(!SessionRules::always_open().has_settled(Timestamp::new(datetime!(2020-01-06 23:59)), grace));
    }
}
