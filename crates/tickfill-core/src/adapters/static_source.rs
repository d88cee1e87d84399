use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::adapter::{AdapterError, FetchBatch, SourceAdapter};
use crate::cursor::Cursor;
use crate::domain::{Entity, RawRecord, SessionRules, Timestamp};
use crate::field_map::parse_timestamp;
use crate::CoreError;

/// Serves fixed records per entity id.
///
/// Records are filtered to those after `cursor.start` (from it when
/// `cursor.include_start` is set) and not after `cursor.end`, or to the
/// cursor's explicit timestamps, then cut to `cursor.size`, so repeated runs
/// converge the way a live source does.
#[derive(Debug, Default)]
pub struct StaticAdapter {
    name: String,
    timestamp_field: String,
    records: HashMap<String, Vec<RawRecord>>,
    failures: Mutex<VecDeque<AdapterError>>,
    calls: AtomicUsize,
}

impl StaticAdapter {
    pub fn new() -> Self {
        Self {
            name: String::from("static"),
            timestamp_field: String::from("timestamp"),
            ..Self::default()
        }
    }

    /// Load `{ "<entity_id>": [ {record}, ... ], ... }`.
    pub fn from_json_file(path: &Path) -> Result<Self, CoreError> {
        let raw = std::fs::read_to_string(path)?;
        let records: HashMap<String, Vec<RawRecord>> = serde_json::from_str(&raw)?;
        let mut adapter = Self::new();
        adapter.name = format!("fixture:{}", path.display());
        adapter.records = records;
        Ok(adapter)
    }

    #[must_use]
    pub fn with_records(mut self, entity_id: impl Into<String>, records: Vec<RawRecord>) -> Self {
        self.records.insert(entity_id.into(), records);
        self
    }

    #[must_use]
    pub fn with_timestamp_field(mut self, field: impl Into<String>) -> Self {
        self.timestamp_field = field.into();
        self
    }

    /// Queue an error returned by the next fetch instead of data.
    pub fn fail_next(&self, error: AdapterError) {
        self.failures
            .lock()
            .expect("static adapter failure queue is not poisoned")
            .push_back(error);
    }

    /// Number of fetch calls so far, failed ones included.
    pub fn fetch_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Replace the records served for `entity_id`.
    pub fn set_records(&mut self, entity_id: impl Into<String>, records: Vec<RawRecord>) {
        self.records.insert(entity_id.into(), records);
    }

    fn select(&self, entity: &Entity, cursor: &Cursor) -> Vec<RawRecord> {
        let offset = SessionRules::for_entity(entity).offset;
        let stamped = self
            .records
            .get(&entity.id)
            .map(|records| {
                records
                    .iter()
                    .map(|record| {
                        let timestamp = record
                            .get(&self.timestamp_field)
                            .and_then(|value| parse_timestamp(value, offset).ok());
                        (timestamp, record)
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        stamped
            .into_iter()
            .filter(|(timestamp, _)| wanted(cursor, *timestamp))
            .take(cursor.size)
            .map(|(_, record)| record.clone())
            .collect()
    }
}

fn wanted(cursor: &Cursor, timestamp: Option<Timestamp>) -> bool {
    if !cursor.timestamps.is_empty() {
        return timestamp.is_some_and(|ts| cursor.timestamps.contains(&ts));
    }
    if let (Some(end), Some(ts)) = (cursor.end, timestamp) {
        if ts > end {
            return false;
        }
    }
    match (cursor.start, timestamp) {
        (Some(start), Some(ts)) => ts > start || (cursor.include_start && ts == start),
        (Some(_), None) => false,
        (None, _) => true,
    }
}

impl SourceAdapter for StaticAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch<'a>(
        &'a self,
        entity: &'a Entity,
        cursor: &'a Cursor,
    ) -> Pin<Box<dyn Future<Output = Result<FetchBatch, AdapterError>> + Send + 'a>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let failure = self
                .failures
                .lock()
                .expect("static adapter failure queue is not poisoned")
                .pop_front();
            if let Some(error) = failure {
                return Err(error);
            }

            Ok(FetchBatch::sized(self.select(entity, cursor), cursor.size))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::macros::datetime;

    fn day(date: &str) -> RawRecord {
        let mut record = RawRecord::new();
        record.insert(String::from("timestamp"), json!(date));
        record.insert(String::from("close"), json!(1.0));
        record
    }

    fn adapter() -> StaticAdapter {
        StaticAdapter::new().with_records(
            "stock_sz_000338",
            vec![day("2020-01-01"), day("2020-01-02"), day("2020-01-03")],
        )
    }

    #[tokio::test]
    async fn serves_records_after_start() {
        let entity = Entity::parse_id("stock_sz_000338").expect("entity");
        let cursor = Cursor::window(Some(Timestamp::new(datetime!(2020-01-01 00:00))), 10);

        let batch = adapter().fetch(&entity, &cursor).await.expect("batch");
        assert_eq!(batch.records.len(), 2);
        assert!(batch.exhausted);
    }

    #[tokio::test]
    async fn inclusive_start_keeps_the_first_record() {
        let entity = Entity::parse_id("stock_sz_000338").expect("entity");
        let cursor = Cursor {
            include_start: true,
            ..Cursor::window(Some(Timestamp::new(datetime!(2020-01-01 00:00))), 10)
        };

        let batch = adapter().fetch(&entity, &cursor).await.expect("batch");
        assert_eq!(batch.records.len(), 3);
    }

    #[tokio::test]
    async fn end_bound_is_inclusive() {
        let entity = Entity::parse_id("stock_sz_000338").expect("entity");
        let cursor = Cursor {
            include_start: true,
            end: Some(Timestamp::new(datetime!(2020-01-02 00:00))),
            ..Cursor::window(Some(Timestamp::new(datetime!(2020-01-01 00:00))), 10)
        };

        let batch = adapter().fetch(&entity, &cursor).await.expect("batch");
        assert_eq!(batch.records.len(), 2);
    }

    #[tokio::test]
    async fn honours_size_and_reports_more_available() {
        let entity = Entity::parse_id("stock_sz_000338").expect("entity");
        let batch = adapter()
            .fetch(&entity, &Cursor::window(None, 2))
            .await
            .expect("batch");
        assert_eq!(batch.records.len(), 2);
        assert!(!batch.exhausted);
    }

    #[tokio::test]
    async fn queued_failures_come_first() {
        let entity = Entity::parse_id("stock_sz_000338").expect("entity");
        let adapter = adapter();
        adapter.fail_next(AdapterError::rate_limited("slow down"));

        assert!(adapter.fetch(&entity, &Cursor::window(None, 2)).await.is_err());
        assert!(adapter.fetch(&entity, &Cursor::window(None, 2)).await.is_ok());
        assert_eq!(adapter.fetch_count(), 2);
    }
}
