//! Storage and entity catalog contracts, plus an in-memory implementation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use serde::Serialize;

use crate::domain::{Entity, EntityType, IntervalLevel, PersistedRecord, Timestamp};
use crate::schema::SchemaSpec;
use crate::StoreError;

/// One persisted batch, as written to the sync log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchLog {
    pub run_id: String,
    pub schema_id: String,
    pub entity_id: String,
    pub record_count: usize,
    pub first: Option<Timestamp>,
    pub last: Option<Timestamp>,
}

/// Durable record storage, keyed by schema.
///
/// Implementations must make [`Store::upsert`] all-or-nothing.
pub trait Store: Send + Sync {
    /// Create or migrate whatever backs `schema`.
    fn prepare(&self, schema: &SchemaSpec) -> Result<(), StoreError>;

    /// Newest record of `entity_id`; records without a timestamp rank last.
    fn latest(
        &self,
        schema: &SchemaSpec,
        entity_id: &str,
        level: Option<IntervalLevel>,
    ) -> Result<Option<PersistedRecord>, StoreError>;

    fn find(
        &self,
        schema: &SchemaSpec,
        entity_id: &str,
        id: &str,
    ) -> Result<Option<PersistedRecord>, StoreError>;

    fn exists(&self, schema: &SchemaSpec, id: &str) -> Result<bool, StoreError>;

    /// Insert or replace `records` in one transaction.
    fn upsert(&self, schema: &SchemaSpec, records: &[PersistedRecord]) -> Result<usize, StoreError>;

    /// Records of `entity_id` whose `field` is null, ascending by timestamp.
    fn records_missing(
        &self,
        schema: &SchemaSpec,
        entity_id: &str,
        field: &str,
    ) -> Result<Vec<PersistedRecord>, StoreError>;

    /// Every record of `entity_id`, ascending by timestamp.
    fn entity_records(
        &self,
        schema: &SchemaSpec,
        entity_id: &str,
    ) -> Result<Vec<PersistedRecord>, StoreError>;

    fn log_batch(&self, entry: &BatchLog) -> Result<(), StoreError>;

    /// Release pooled resources at the end of a run.
    fn close(&self) {}
}

/// Catalog filter. Empty lists match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityQuery {
    pub entity_type: Option<EntityType>,
    pub exchanges: Vec<String>,
    pub ids: Vec<String>,
    pub codes: Vec<String>,
}

impl EntityQuery {
    pub fn of_type(entity_type: EntityType) -> Self {
        Self {
            entity_type: Some(entity_type),
            ..Self::default()
        }
    }

    pub fn matches(&self, entity: &Entity) -> bool {
        self.entity_type.map_or(true, |kind| kind == entity.entity_type)
            && (self.exchanges.is_empty() || self.exchanges.iter().any(|e| *e == entity.exchange))
            && (self.ids.is_empty() || self.ids.iter().any(|id| *id == entity.id))
            && (self.codes.is_empty() || self.codes.iter().any(|code| *code == entity.code))
    }
}

/// Lookup of tracked entities.
pub trait EntityCatalog: Send + Sync {
    fn list(&self, query: &EntityQuery) -> Result<Vec<Entity>, StoreError>;
}

/// Store and catalog held in memory. Used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: HashMap<String, BTreeMap<String, PersistedRecord>>,
    entities: Vec<Entity>,
    logs: Vec<BatchLog>,
    upserts: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_entities(self, entities: Vec<Entity>) -> Self {
        self.state
            .lock()
            .expect("memory store mutex poisoned")
            .entities = entities;
        self
    }

    /// Batches logged so far, oldest first.
    pub fn batch_logs(&self) -> Vec<BatchLog> {
        self.state
            .lock()
            .expect("memory store mutex poisoned")
            .logs
            .clone()
    }

    /// Number of non-empty upsert calls.
    pub fn upsert_count(&self) -> usize {
        self.state.lock().expect("memory store mutex poisoned").upserts
    }

    fn read<T>(&self, schema: &SchemaSpec, f: impl FnOnce(Option<&BTreeMap<String, PersistedRecord>>) -> T) -> T {
        let state = self.state.lock().expect("memory store mutex poisoned");
        f(state.tables.get(&schema.table))
    }
}

fn ascending(mut records: Vec<PersistedRecord>) -> Vec<PersistedRecord> {
    records.sort_by(|left, right| {
        (left.timestamp.is_none(), left.timestamp, &left.id).cmp(&(
            right.timestamp.is_none(),
            right.timestamp,
            &right.id,
        ))
    });
    records
}

impl Store for MemoryStore {
    fn prepare(&self, schema: &SchemaSpec) -> Result<(), StoreError> {
        self.state
            .lock()
            .expect("memory store mutex poisoned")
            .tables
            .entry(schema.table.clone())
            .or_default();
        Ok(())
    }

    fn latest(
        &self,
        schema: &SchemaSpec,
        entity_id: &str,
        level: Option<IntervalLevel>,
    ) -> Result<Option<PersistedRecord>, StoreError> {
        Ok(self.read(schema, |table| {
            table.and_then(|records| {
                records
                    .values()
                    .filter(|record| record.entity_id == entity_id)
                    .filter(|record| level.is_none() || record.level == level)
                    .max_by_key(|record| (record.timestamp.is_some(), record.timestamp))
                    .cloned()
            })
        }))
    }

    fn find(
        &self,
        schema: &SchemaSpec,
        entity_id: &str,
        id: &str,
    ) -> Result<Option<PersistedRecord>, StoreError> {
        Ok(self.read(schema, |table| {
            table
                .and_then(|records| records.get(id))
                .filter(|record| record.entity_id == entity_id)
                .cloned()
        }))
    }

    fn exists(&self, schema: &SchemaSpec, id: &str) -> Result<bool, StoreError> {
        Ok(self.read(schema, |table| table.is_some_and(|records| records.contains_key(id))))
    }

    fn upsert(&self, schema: &SchemaSpec, records: &[PersistedRecord]) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut state = self.state.lock().expect("memory store mutex poisoned");
        let table = state.tables.entry(schema.table.clone()).or_default();
        for record in records {
            table.insert(record.id.clone(), record.clone());
        }
        state.upserts += 1;
        Ok(records.len())
    }

    fn records_missing(
        &self,
        schema: &SchemaSpec,
        entity_id: &str,
        field: &str,
    ) -> Result<Vec<PersistedRecord>, StoreError> {
        if schema.field(field).is_none() {
            return Err(StoreError::Backend(format!(
                "schema '{}' has no field '{field}'",
                schema.id
            )));
        }

        let missing = self.read(schema, |table| {
            table
                .map(|records| {
                    records
                        .values()
                        .filter(|record| record.entity_id == entity_id)
                        .filter(|record| record.field(field).map_or(true, |value| value.is_null()))
                        .cloned()
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default()
        });
        Ok(ascending(missing))
    }

    fn entity_records(
        &self,
        schema: &SchemaSpec,
        entity_id: &str,
    ) -> Result<Vec<PersistedRecord>, StoreError> {
        let records = self.read(schema, |table| {
            table
                .map(|records| {
                    records
                        .values()
                        .filter(|record| record.entity_id == entity_id)
                        .cloned()
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default()
        });
        Ok(ascending(records))
    }

    fn log_batch(&self, entry: &BatchLog) -> Result<(), StoreError> {
        self.state
            .lock()
            .expect("memory store mutex poisoned")
            .logs
            .push(entry.clone());
        Ok(())
    }
}

impl EntityCatalog for MemoryStore {
    fn list(&self, query: &EntityQuery) -> Result<Vec<Entity>, StoreError> {
        let state = self.state.lock().expect("memory store mutex poisoned");
        let mut entities = state
            .entities
            .iter()
            .filter(|entity| query.matches(entity))
            .cloned()
            .collect::<Vec<_>>();
        entities.sort_by(|left, right| left.id.cmp(&right.id));
        Ok(entities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FieldValue;
    use crate::schema::kdata_schema;
    use time::macros::datetime;

    fn bar(id: &str, timestamp: Option<Timestamp>) -> PersistedRecord {
        PersistedRecord {
            id: id.to_string(),
            entity_id: String::from("stock_sz_000338"),
            code: String::from("000338"),
            timestamp,
            level: Some(IntervalLevel::OneDay),
            fields: BTreeMap::from([(String::from("close"), FieldValue::Float(1.0))]),
        }
    }

    #[test]
    fn latest_prefers_timestamped_records() {
        let schema = kdata_schema(EntityType::Stock, IntervalLevel::OneDay);
        let store = MemoryStore::new();
        store
            .upsert(
                &schema,
                &[
                    bar("a", Some(Timestamp::new(datetime!(2020-01-02 00:00)))),
                    bar("b", None),
                    bar("c", Some(Timestamp::new(datetime!(2020-01-01 00:00)))),
                ],
            )
            .expect("upsert");

        let latest = store
            .latest(&schema, "stock_sz_000338", Some(IntervalLevel::OneDay))
            .expect("latest")
            .expect("some record");
        assert_eq!(latest.id, "a");

        let ids = store
            .entity_records(&schema, "stock_sz_000338")
            .expect("records")
            .into_iter()
            .map(|record| record.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn catalog_filters_by_type_and_exchange() {
        let store = MemoryStore::new().with_entities(vec![
            Entity::parse_id("stock_sz_000338").expect("entity"),
            Entity::parse_id("stock_sh_600000").expect("entity"),
            Entity::parse_id("coin_binance_btc").expect("entity"),
        ]);

        let query = EntityQuery {
            exchanges: vec![String::from("sz")],
            ..EntityQuery::of_type(EntityType::Stock)
        };
        let listed = store.list(&query).expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "stock_sz_000338");
    }
}
