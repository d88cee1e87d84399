//! Per-entity callbacks run when an entity finishes syncing.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::adapter::{AdapterError, SourceAdapter};
use crate::cursor::Cursor;
use crate::domain::{Entity, FieldValue, PersistedRecord, SessionRules, Timestamp};
use crate::field_map::{parse_timestamp, Transform};
use crate::schema::SchemaSpec;
use crate::error::StoreError;
use crate::store::Store;

#[derive(Debug, Error)]
pub enum HookError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

pub trait FinishHook: Send + Sync {
    fn name(&self) -> &str;

    /// Returns the number of records the hook rewrote.
    fn on_finish<'a>(
        &'a self,
        store: &'a dyn Store,
        schema: &'a SchemaSpec,
        entity: &'a Entity,
    ) -> Pin<Box<dyn Future<Output = Result<usize, HookError>> + Send + 'a>>;
}

/// Fills null values of `field` with `source / previous source - 1` over the
/// stored series.
#[derive(Debug, Clone)]
pub struct BackfillHook {
    name: String,
    field: String,
    source: String,
}

impl BackfillHook {
    pub fn change_from_previous(field: impl Into<String>, source: impl Into<String>) -> Self {
        let field = field.into();
        Self {
            name: format!("backfill:{field}"),
            field,
            source: source.into(),
        }
    }

    /// `change_pct` from consecutive closes.
    pub fn change_pct() -> Self {
        Self::change_from_previous("change_pct", "close")
    }

    fn change(&self, previous: Option<&PersistedRecord>, record: &PersistedRecord) -> Option<f64> {
        let current = record.field(&self.source).and_then(FieldValue::as_f64)?;
        let previous = previous?.field(&self.source).and_then(FieldValue::as_f64)?;
        (previous != 0.0).then(|| current / previous - 1.0)
    }

    fn fill(&self, store: &dyn Store, schema: &SchemaSpec, entity: &Entity) -> Result<usize, StoreError> {
        if schema.field(&self.field).is_none() {
            return Ok(0);
        }
        let missing = store.records_missing(schema, &entity.id, &self.field)?;
        if missing.is_empty() {
            return Ok(0);
        }
        let missing_ids = missing.iter().map(|record| record.id.as_str()).collect::<HashSet<_>>();

        let series = store.entity_records(schema, &entity.id)?;
        let mut updated = Vec::new();
        for (index, record) in series.iter().enumerate() {
            if !missing_ids.contains(record.id.as_str()) {
                continue;
            }
            let previous = index.checked_sub(1).and_then(|prev| series.get(prev));
            if let Some(value) = self.change(previous, record) {
                let mut record = record.clone();
                record.set_field(self.field.clone(), FieldValue::Float(value));
                updated.push(record);
            }
        }

        let written = store.upsert(schema, &updated)?;
        if written > 0 {
            info!(hook = %self.name, entity_id = %entity.id, count = written, "back-filled records");
        }
        Ok(written)
    }
}

impl FinishHook for BackfillHook {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_finish<'a>(
        &'a self,
        store: &'a dyn Store,
        schema: &'a SchemaSpec,
        entity: &'a Entity,
    ) -> Pin<Box<dyn Future<Output = Result<usize, HookError>> + Send + 'a>> {
        Box::pin(async move { Ok(self.fill(store, schema, entity)?) })
    }
}

/// Fills records whose `key_field` is still null from a figure series that a
/// second source publishes separately, such as a fund's cumulative net value.
///
/// The source is asked for the span from the first to the last unfilled
/// record (both inclusive). Figures are matched to records by day for
/// daily-or-coarser schemas and by exact time otherwise. Records without a
/// matching figure stay null and are retried when the entity next finishes.
pub struct ExternalBackfillHook {
    name: String,
    key_field: String,
    source: Arc<dyn SourceAdapter>,
    timestamp_field: String,
    fields: Vec<(String, String, Transform)>,
}

impl ExternalBackfillHook {
    /// Fill `key_field` from the same-named figure field.
    pub fn new(key_field: impl Into<String>, source: Arc<dyn SourceAdapter>) -> Self {
        let key_field = key_field.into();
        Self {
            name: format!("backfill:{key_field}"),
            fields: vec![(key_field.clone(), key_field.clone(), Transform::Identity)],
            key_field,
            source,
            timestamp_field: String::from("timestamp"),
        }
    }

    /// `cumulative_net_value` and the day's `change_pct` from a net value series.
    pub fn cumulative_net_value(source: Arc<dyn SourceAdapter>) -> Self {
        Self::new("cumulative_net_value", source).with_field("change_pct", "change_pct", Transform::Identity)
    }

    /// Also copy figure field `raw` into record field `target`.
    #[must_use]
    pub fn with_field(mut self, raw: impl Into<String>, target: impl Into<String>, transform: Transform) -> Self {
        self.fields.push((raw.into(), target.into(), transform));
        self
    }

    #[must_use]
    pub fn with_timestamp_field(mut self, field: impl Into<String>) -> Self {
        self.timestamp_field = field.into();
        self
    }

    fn match_key(schema: &SchemaSpec, timestamp: Timestamp) -> String {
        if schema.uses_day_ids() {
            timestamp.format_day()
        } else {
            timestamp.format_precise()
        }
    }

    async fn fill(&self, store: &dyn Store, schema: &SchemaSpec, entity: &Entity) -> Result<usize, HookError> {
        if schema.field(&self.key_field).is_none() {
            return Ok(0);
        }
        let missing = store
            .records_missing(schema, &entity.id, &self.key_field)?
            .into_iter()
            .filter(|record| record.timestamp.is_some())
            .collect::<Vec<_>>();
        let (Some(first), Some(last)) = (
            missing.first().and_then(|record| record.timestamp),
            missing.last().and_then(|record| record.timestamp),
        ) else {
            return Ok(0);
        };

        let span = store
            .entity_records(schema, &entity.id)?
            .iter()
            .filter_map(|record| record.timestamp)
            .filter(|timestamp| (first..=last).contains(timestamp))
            .count();
        let cursor = Cursor {
            include_start: true,
            end: Some(last),
            ..Cursor::window(Some(first), span.max(missing.len()))
        };
        let batch = self.source.fetch(entity, &cursor).await?;

        let offset = SessionRules::for_entity(entity).offset;
        let mut figures = HashMap::new();
        for raw in &batch.records {
            match raw.get(&self.timestamp_field).map(|value| parse_timestamp(value, offset)) {
                Some(Ok(timestamp)) => {
                    figures.insert(Self::match_key(schema, timestamp), raw);
                }
                Some(Err(error)) => {
                    warn!(hook = %self.name, entity_id = %entity.id, error = %error, "figure timestamp unreadable");
                }
                None => debug!(hook = %self.name, entity_id = %entity.id, "figure without timestamp"),
            }
        }

        let mut updated = Vec::new();
        for mut record in missing {
            let Some(raw) = record
                .timestamp
                .and_then(|timestamp| figures.get(&Self::match_key(schema, timestamp)))
            else {
                continue;
            };
            for (source, target, transform) in &self.fields {
                let (Some(field), Some(value)) = (schema.field(target), raw.get(source)) else {
                    continue;
                };
                match transform.apply(value, field.kind, offset) {
                    Ok(converted) => record.set_field(target.clone(), converted),
                    Err(error) => {
                        warn!(hook = %self.name, id = %record.id, field = %target, error = %error, "figure conversion failed");
                    }
                }
            }
            if record.field(&self.key_field).is_some_and(|value| !value.is_null()) {
                updated.push(record);
            }
        }

        let written = store.upsert(schema, &updated)?;
        info!(
            hook = %self.name,
            entity_id = %entity.id,
            source = self.source.name(),
            figures = figures.len(),
            count = written,
            "back-filled records from external figures"
        );
        Ok(written)
    }
}

impl FinishHook for ExternalBackfillHook {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_finish<'a>(
        &'a self,
        store: &'a dyn Store,
        schema: &'a SchemaSpec,
        entity: &'a Entity,
    ) -> Pin<Box<dyn Future<Output = Result<usize, HookError>> + Send + 'a>> {
        Box::pin(self.fill(store, schema, entity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::StaticAdapter;
    use crate::domain::{EntityType, IntervalLevel, RawRecord};
    use crate::schema::kdata_schema;
    use crate::store::MemoryStore;
    use serde_json::json;
    use time::macros::date;

    fn bar(day: time::Date, close: f64, change: Option<f64>) -> PersistedRecord {
        let timestamp = Timestamp::from_date(day);
        let mut record = PersistedRecord {
            id: format!("etf_sh_510300_{}", timestamp.format_day()),
            entity_id: String::from("etf_sh_510300"),
            code: String::from("510300"),
            timestamp: Some(timestamp),
            level: Some(IntervalLevel::OneDay),
            fields: Default::default(),
        };
        record.set_field("close", FieldValue::Float(close));
        record.set_field("change_pct", change.map_or(FieldValue::Null, FieldValue::Float));
        record.set_field("cumulative_net_value", FieldValue::Null);
        record
    }

    fn net_value(day: &str, value: f64, change: f64) -> RawRecord {
        let mut record = RawRecord::new();
        record.insert(String::from("timestamp"), json!(day));
        record.insert(String::from("cumulative_net_value"), json!(value));
        record.insert(String::from("change_pct"), json!(change));
        record
    }

    fn etf() -> Entity {
        Entity::parse_id("etf_sh_510300").expect("entity")
    }

    #[tokio::test]
    async fn change_pct_is_filled_from_previous_close() {
        let store = MemoryStore::new();
        let schema = kdata_schema(EntityType::Etf, IntervalLevel::OneDay);
        store
            .upsert(
                &schema,
                &[
                    bar(date!(2020-01-02), 4.0, Some(0.0)),
                    bar(date!(2020-01-03), 5.0, None),
                ],
            )
            .expect("upsert");

        let written = BackfillHook::change_pct()
            .on_finish(&store, &schema, &etf())
            .await
            .expect("hook");
        assert_eq!(written, 1);

        let records = store.entity_records(&schema, "etf_sh_510300").expect("records");
        assert_eq!(records[1].field("change_pct"), Some(&FieldValue::Float(0.25)));
    }

    #[tokio::test]
    async fn nothing_missing_writes_nothing() {
        let store = MemoryStore::new();
        let schema = kdata_schema(EntityType::Etf, IntervalLevel::OneDay);
        store
            .upsert(&schema, &[bar(date!(2020-01-02), 4.0, Some(0.1))])
            .expect("upsert");

        let written = BackfillHook::change_pct()
            .on_finish(&store, &schema, &etf())
            .await
            .expect("hook");
        assert_eq!(written, 0);
        assert_eq!(store.upsert_count(), 1);
    }

    #[tokio::test]
    async fn net_values_fill_matching_days_only() {
        let store = MemoryStore::new();
        let schema = kdata_schema(EntityType::Etf, IntervalLevel::OneDay);
        store
            .upsert(
                &schema,
                &[
                    bar(date!(2020-01-02), 4.0, None),
                    bar(date!(2020-01-03), 1.23, None),
                    bar(date!(2020-01-06), 4.2, None),
                ],
            )
            .expect("upsert");
        let source = Arc::new(StaticAdapter::new().with_records(
            "etf_sh_510300",
            vec![
                net_value("2020-01-01", 3.9, 0.2),
                net_value("2020-01-02", 4.01, 0.5),
                net_value("2020-01-03", 4.05, 1.0),
            ],
        ));

        let written = ExternalBackfillHook::cumulative_net_value(source)
            .on_finish(&store, &schema, &etf())
            .await
            .expect("hook");

        assert_eq!(written, 2);
        let records = store.entity_records(&schema, "etf_sh_510300").expect("records");
        assert_eq!(records[0].field("cumulative_net_value"), Some(&FieldValue::Float(4.01)));
        assert_eq!(records[0].field("change_pct"), Some(&FieldValue::Float(0.5)));
        assert_eq!(records[1].field("cumulative_net_value"), Some(&FieldValue::Float(4.05)));
        assert_eq!(records[2].field("cumulative_net_value"), Some(&FieldValue::Null));
        assert_eq!(records[2].field("close"), Some(&FieldValue::Float(4.2)));
    }

    #[tokio::test]
    async fn source_failures_surface_as_adapter_errors() {
        let store = MemoryStore::new();
        let schema = kdata_schema(EntityType::Etf, IntervalLevel::OneDay);
        store
            .upsert(&schema, &[bar(date!(2020-01-02), 4.0, None)])
            .expect("upsert");
        let source = Arc::new(StaticAdapter::new());
        source.fail_next(AdapterError::unavailable("503"));

        let error = ExternalBackfillHook::cumulative_net_value(source)
            .on_finish(&store, &schema, &etf())
            .await
            .expect_err("source down");
        assert!(matches!(error, HookError::Adapter(_)));
    }
}
