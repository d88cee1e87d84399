//! Next-fetch window computation.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::adapter::AdapterError;
use crate::config::SyncConfig;
use crate::context::RunContext;
use crate::domain::{Entity, IntervalLevel, PersistedRecord, SessionRules, Timestamp};
use crate::schema::{Cadence, SchemaSpec};
use crate::SyncError;

/// Demand for one entity in the next cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Cursor {
    /// Lower bound; `None` means the source default.
    pub start: Option<Timestamp>,
    /// `start` itself is wanted. Set for the first fetch from inception;
    /// a bound taken from the latest stored record is exclusive.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub include_start: bool,
    pub end: Option<Timestamp>,
    /// Records wanted; zero means nothing to fetch.
    pub size: usize,
    /// Explicit instants for announcement-driven schemas, ascending.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub timestamps: Vec<Timestamp>,
    /// Backoff computed for an open period, reported for logging.
    #[serde(skip)]
    pub wait: Duration,
}

impl Cursor {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn window(start: Option<Timestamp>, size: usize) -> Self {
        Self {
            start,
            size,
            ..Self::default()
        }
    }

    pub const fn is_done(&self) -> bool {
        self.size == 0
    }
}

/// Enumerates the instants at which an announcement-driven schema publishes.
pub trait TimestampSource: Send + Sync {
    fn timestamps<'a>(
        &'a self,
        entity: &'a Entity,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Timestamp>, AdapterError>> + Send + 'a>>;
}

/// Fixed instants per entity id.
#[derive(Debug, Clone, Default)]
pub struct StaticTimestamps {
    by_entity: HashMap<String, Vec<Timestamp>>,
}

impl StaticTimestamps {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, entity_id: impl Into<String>, timestamps: Vec<Timestamp>) -> Self {
        self.by_entity.insert(entity_id.into(), timestamps);
        self
    }
}

impl TimestampSource for StaticTimestamps {
    fn timestamps<'a>(
        &'a self,
        entity: &'a Entity,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Timestamp>, AdapterError>> + Send + 'a>> {
        let timestamps = self.by_entity.get(&entity.id).cloned().unwrap_or_default();
        Box::pin(async move { Ok(timestamps) })
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// Computes cursors for one run. Announcement instants are fetched once per
/// entity and reused for the rest of the run.
pub struct CursorResolver<'a> {
    schema: &'a SchemaSpec,
    config: &'a SyncConfig,
    timestamps: Option<Arc<dyn TimestampSource>>,
    cache: HashMap<String, Vec<Timestamp>>,
}

impl<'a> CursorResolver<'a> {
    pub fn new(
        schema: &'a SchemaSpec,
        config: &'a SyncConfig,
        timestamps: Option<Arc<dyn TimestampSource>>,
    ) -> Self {
        Self {
            schema,
            config,
            timestamps,
            cache: HashMap::new(),
        }
    }

    pub async fn resolve(
        &mut self,
        ctx: &RunContext,
        entity: &Entity,
        latest: Option<&PersistedRecord>,
    ) -> Result<Cursor, ResolveError> {
        // A latest record without a timestamp cannot anchor a window.
        let latest = latest.and_then(|record| record.timestamp);

        match self.schema.cadence {
            Cadence::Announcement => self.resolve_announcement(entity, latest).await,
            Cadence::TimeSeries | Cadence::FixedCycle(IntervalLevel::Tick) => {
                Ok(self.resolve_series(entity, latest))
            }
            Cadence::FixedCycle(level) => match latest {
                None => Ok(self.resolve_series(entity, None)),
                Some(latest) if level.is_daily_or_coarser() => {
                    Ok(self.resolve_daily(ctx, entity, latest))
                }
                Some(latest) => self.resolve_intraday(ctx, entity, level, latest).await,
            },
        }
    }

    fn resolve_series(&self, entity: &Entity, latest: Option<Timestamp>) -> Cursor {
        match latest {
            Some(latest) => Cursor::window(Some(latest), self.config.default_size),
            None => Cursor {
                include_start: entity.inception.is_some(),
                ..Cursor::window(entity.inception, self.config.default_size)
            },
        }
    }

    fn resolve_daily(&self, ctx: &RunContext, entity: &Entity, latest: Timestamp) -> Cursor {
        let rules = SessionRules::for_entity(entity);
        let today = rules.wall_clock(ctx.now()).date();
        if latest.date() == today {
            debug!(entity_id = %entity.id, latest = %latest, "latest bar is from today");
            return Cursor::done();
        }

        let days = (today - latest.date()).whole_days().max(0);
        Cursor::window(Some(latest), usize::try_from(days + 1).unwrap_or(usize::MAX))
    }

    async fn resolve_intraday(
        &self,
        ctx: &RunContext,
        entity: &Entity,
        level: IntervalLevel,
        latest: Timestamp,
    ) -> Result<Cursor, ResolveError> {
        let rules = SessionRules::for_entity(entity);
        let now = rules.wall_clock(ctx.now());
        if rules.is_closing_bar(latest, now) {
            debug!(entity_id = %entity.id, latest = %latest, "closing bar already stored");
            return Ok(Cursor::done());
        }

        let touching = match (self.config.bar_timestamp_is_open, level.period()) {
            (true, Some(period)) => latest.checked_add(period).unwrap_or(latest),
            _ => latest,
        };

        let mut count = level.count_from(touching, now, &rules);
        let wait = Duration::try_from(count.wait).unwrap_or_default();
        if !self.config.one_shot && wait > self.config.backoff_threshold {
            info!(
                entity_id = %entity.id,
                level = %level,
                wait_secs = wait.as_secs(),
                "period still open, backing off"
            );
            ctx.sleep(wait / 2).await?;
            count = level.count_from(touching, rules.wall_clock(ctx.now()), &rules);
        }

        Ok(Cursor {
            start: Some(latest),
            size: count.size,
            wait,
            ..Cursor::default()
        })
    }

    async fn resolve_announcement(
        &mut self,
        entity: &Entity,
        latest: Option<Timestamp>,
    ) -> Result<Cursor, ResolveError> {
        if !self.cache.contains_key(&entity.id) {
            let source = self
                .timestamps
                .as_ref()
                .ok_or_else(|| SyncError::MissingTimestampSource(self.schema.id.clone()))?;
            let mut timestamps = source.timestamps(entity).await?;
            timestamps.sort_unstable();
            timestamps.dedup();
            self.cache.insert(entity.id.clone(), timestamps);
        }

        let remaining = self
            .cache
            .get(&entity.id)
            .map(|all| {
                all.iter()
                    .copied()
                    .filter(|timestamp| latest.map_or(true, |latest| *timestamp > latest))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        Ok(Cursor {
            start: remaining.first().copied(),
            include_start: true,
            end: remaining.last().copied(),
            size: remaining.len(),
            timestamps: remaining,
            wait: Duration::ZERO,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::domain::EntityType;
    use crate::schema::{kdata_schema, SchemaRegistry};
    use std::collections::BTreeMap;
    use time::macros::datetime;

    fn record(timestamp: Timestamp) -> PersistedRecord {
        PersistedRecord {
            id: String::from("x"),
            entity_id: String::from("stock_sz_000338"),
            code: String::from("000338"),
            timestamp: Some(timestamp),
            level: None,
            fields: BTreeMap::new(),
        }
    }

    fn stock() -> Entity {
        Entity::parse_id("stock_sz_000338").expect("entity")
    }

    fn ctx_at(now: time::OffsetDateTime) -> (Arc<ManualClock>, RunContext) {
        let clock = Arc::new(ManualClock::new(now));
        let ctx = RunContext::new(clock.clone());
        (clock, ctx)
    }

    #[tokio::test]
    async fn daily_same_day_needs_nothing() {
        let schema = kdata_schema(EntityType::Stock, IntervalLevel::OneDay);
        let config = SyncConfig::default();
        let mut resolver = CursorResolver::new(&schema, &config, None);
        // 10:00 at +08:00 on 2020-01-05
        let (_, ctx) = ctx_at(datetime!(2020-01-05 02:00 UTC));

        let latest = record(Timestamp::new(datetime!(2020-01-05 00:00)));
        let cursor = resolver.resolve(&ctx, &stock(), Some(&latest)).await.expect("cursor");
        assert!(cursor.is_done());
    }

    #[tokio::test]
    async fn daily_gap_counts_days_plus_one() {
        let schema = kdata_schema(EntityType::Stock, IntervalLevel::OneDay);
        let config = SyncConfig::default();
        let mut resolver = CursorResolver::new(&schema, &config, None);
        let (_, ctx) = ctx_at(datetime!(2020-01-08 02:00 UTC));

        let latest = record(Timestamp::new(datetime!(2020-01-05 00:00)));
        let cursor = resolver.resolve(&ctx, &stock(), Some(&latest)).await.expect("cursor");
        assert_eq!(cursor.size, 4);
        assert_eq!(cursor.start, latest.timestamp);
    }

    #[tokio::test]
    async fn no_record_starts_from_inception_with_default_size() {
        let schema = kdata_schema(EntityType::Stock, IntervalLevel::OneDay);
        let config = SyncConfig::default();
        let mut resolver = CursorResolver::new(&schema, &config, None);
        let (_, ctx) = ctx_at(datetime!(2020-01-08 02:00 UTC));
        let inception = Timestamp::new(datetime!(2020-01-01 00:00));
        let entity = stock().with_inception(inception);

        let untimed = PersistedRecord {
            timestamp: None,
            ..record(inception)
        };
        let cursor = resolver.resolve(&ctx, &entity, Some(&untimed)).await.expect("cursor");
        assert_eq!(cursor.start, Some(inception));
        assert!(cursor.include_start);
        assert_eq!(cursor.size, 2000);
    }

    #[tokio::test]
    async fn closing_bar_of_today_needs_nothing() {
        let schema = kdata_schema(EntityType::Stock, IntervalLevel::FiveMinutes);
        let config = SyncConfig::default();
        let mut resolver = CursorResolver::new(&schema, &config, None);
        let (_, ctx) = ctx_at(datetime!(2020-01-06 09:00 UTC));

        let latest = record(Timestamp::new(datetime!(2020-01-06 15:00)));
        let cursor = resolver.resolve(&ctx, &stock(), Some(&latest)).await.expect("cursor");
        assert!(cursor.is_done());
    }

    #[tokio::test]
    async fn open_period_backs_off_half_the_wait() {
        let schema = kdata_schema(EntityType::Stock, IntervalLevel::OneHour);
        let config = SyncConfig::default();
        let mut resolver = CursorResolver::new(&schema, &config, None);
        // 10:20 local, latest bar 10:00 -> 40 minutes until the next bar closes.
        let (clock, ctx) = ctx_at(datetime!(2020-01-06 02:20 UTC));

        let latest = record(Timestamp::new(datetime!(2020-01-06 10:00)));
        let cursor = resolver.resolve(&ctx, &stock(), Some(&latest)).await.expect("cursor");

        assert_eq!(clock.sleeps(), vec![Duration::from_secs(20 * 60)]);
        assert_eq!(cursor.wait, Duration::from_secs(40 * 60));
        assert_eq!(cursor.size, 0);
    }

    #[tokio::test]
    async fn one_shot_never_backs_off() {
        let schema = kdata_schema(EntityType::Stock, IntervalLevel::OneHour);
        let config = SyncConfig::default().with_one_shot(true);
        let mut resolver = CursorResolver::new(&schema, &config, None);
        let (clock, ctx) = ctx_at(datetime!(2020-01-06 02:20 UTC));

        let latest = record(Timestamp::new(datetime!(2020-01-06 10:00)));
        resolver.resolve(&ctx, &stock(), Some(&latest)).await.expect("cursor");
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn announcements_after_latest_are_kept_in_order() {
        let registry = SchemaRegistry::builtin();
        let schema = registry.get("finance_report").expect("schema");
        let config = SyncConfig::default();
        let source = StaticTimestamps::new().with(
            "stock_sz_000338",
            vec![
                Timestamp::new(datetime!(2020-08-30 00:00)),
                Timestamp::new(datetime!(2020-04-30 00:00)),
                Timestamp::new(datetime!(2020-10-30 00:00)),
            ],
        );
        let mut resolver = CursorResolver::new(schema, &config, Some(Arc::new(source)));
        let (_, ctx) = ctx_at(datetime!(2020-11-01 00:00 UTC));

        let latest = record(Timestamp::new(datetime!(2020-04-30 00:00)));
        let cursor = resolver.resolve(&ctx, &stock(), Some(&latest)).await.expect("cursor");
        assert_eq!(cursor.size, 2);
        assert_eq!(cursor.start, Some(Timestamp::new(datetime!(2020-08-30 00:00))));
        assert_eq!(cursor.end, Some(Timestamp::new(datetime!(2020-10-30 00:00))));
    }

    #[tokio::test]
    async fn announcement_without_source_is_a_run_error() {
        let registry = SchemaRegistry::builtin();
        let schema = registry.get("finance_report").expect("schema");
        let config = SyncConfig::default();
        let mut resolver = CursorResolver::new(schema, &config, None);
        let (_, ctx) = ctx_at(datetime!(2020-11-01 00:00 UTC));

        let err = resolver.resolve(&ctx, &stock(), None).await.expect_err("no source");
        assert!(matches!(err, ResolveError::Sync(SyncError::MissingTimestampSource(_))));
    }
}
