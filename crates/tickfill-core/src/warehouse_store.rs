//! [`Store`] and [`EntityCatalog`] backed by the DuckDB warehouse.

use std::str::FromStr;
use std::sync::Arc;

use tickfill_warehouse::{Cell, EntityFilter, EntityRow, RecordRow, SyncLogEntry, Warehouse};

use crate::domain::{Entity, EntityType, FieldValue, IntervalLevel, PersistedRecord, Timestamp};
use crate::schema::{FieldKind, SchemaSpec};
use crate::store::{BatchLog, EntityCatalog, EntityQuery, Store};
use crate::StoreError;

#[derive(Clone)]
pub struct WarehouseStore {
    warehouse: Arc<Warehouse>,
}

impl WarehouseStore {
    pub fn new(warehouse: Arc<Warehouse>) -> Self {
        Self { warehouse }
    }

    pub fn warehouse(&self) -> &Warehouse {
        &self.warehouse
    }

    /// Insert or replace catalog entries.
    pub fn import_entities(&self, entities: &[Entity]) -> Result<usize, StoreError> {
        let rows = entities.iter().map(entity_row).collect::<Vec<_>>();
        Ok(self.warehouse.upsert_entities(&rows)?)
    }
}

impl Store for WarehouseStore {
    fn prepare(&self, schema: &SchemaSpec) -> Result<(), StoreError> {
        self.warehouse.register_table(&schema.table_def())?;
        Ok(())
    }

    fn latest(
        &self,
        schema: &SchemaSpec,
        entity_id: &str,
        level: Option<IntervalLevel>,
    ) -> Result<Option<PersistedRecord>, StoreError> {
        self.warehouse
            .latest_row(&schema.table, entity_id, level.map(IntervalLevel::as_str))?
            .map(|row| from_row(schema, row))
            .transpose()
    }

    fn find(
        &self,
        schema: &SchemaSpec,
        entity_id: &str,
        id: &str,
    ) -> Result<Option<PersistedRecord>, StoreError> {
        self.warehouse
            .find_row(&schema.table, entity_id, id)?
            .map(|row| from_row(schema, row))
            .transpose()
    }

    fn exists(&self, schema: &SchemaSpec, id: &str) -> Result<bool, StoreError> {
        Ok(self.warehouse.row_exists(&schema.table, id)?)
    }

    fn upsert(&self, schema: &SchemaSpec, records: &[PersistedRecord]) -> Result<usize, StoreError> {
        let rows = records
            .iter()
            .map(|record| to_row(schema, record))
            .collect::<Vec<_>>();
        Ok(self.warehouse.upsert_rows(&schema.table, &rows)?)
    }

    fn records_missing(
        &self,
        schema: &SchemaSpec,
        entity_id: &str,
        field: &str,
    ) -> Result<Vec<PersistedRecord>, StoreError> {
        self.warehouse
            .rows_missing(&schema.table, entity_id, field)?
            .into_iter()
            .map(|row| from_row(schema, row))
            .collect()
    }

    fn entity_records(
        &self,
        schema: &SchemaSpec,
        entity_id: &str,
    ) -> Result<Vec<PersistedRecord>, StoreError> {
        self.warehouse
            .entity_rows(&schema.table, entity_id)?
            .into_iter()
            .map(|row| from_row(schema, row))
            .collect()
    }

    fn log_batch(&self, entry: &BatchLog) -> Result<(), StoreError> {
        self.warehouse.log_sync(&SyncLogEntry {
            run_id: entry.run_id.clone(),
            schema_id: entry.schema_id.clone(),
            entity_id: entry.entity_id.clone(),
            record_count: u64::try_from(entry.record_count).unwrap_or(u64::MAX),
            first_ts: entry.first.map(Timestamp::format_store),
            last_ts: entry.last.map(Timestamp::format_store),
        })?;
        Ok(())
    }

    fn close(&self) {
        self.warehouse.release_idle();
    }
}

impl EntityCatalog for WarehouseStore {
    fn list(&self, query: &EntityQuery) -> Result<Vec<Entity>, StoreError> {
        let filter = EntityFilter {
            entity_type: query.entity_type.map(|kind| kind.as_str().to_string()),
            exchanges: query.exchanges.clone(),
            ids: query.ids.clone(),
            codes: query.codes.clone(),
        };
        self.warehouse
            .list_entities(&filter)?
            .into_iter()
            .map(entity_from_row)
            .collect()
    }
}

fn to_row(schema: &SchemaSpec, record: &PersistedRecord) -> RecordRow {
    RecordRow {
        id: record.id.clone(),
        entity_id: record.entity_id.clone(),
        code: record.code.clone(),
        timestamp: record.timestamp.map(Timestamp::format_store),
        level: record.level.map(|level| level.as_str().to_string()),
        cells: schema
            .fields
            .iter()
            .map(|field| {
                let cell = record.field(&field.name).map_or(Cell::Null, to_cell);
                (field.name.clone(), cell)
            })
            .collect(),
    }
}

fn to_cell(value: &FieldValue) -> Cell {
    match value {
        FieldValue::Null => Cell::Null,
        FieldValue::Bool(flag) => Cell::Bool(*flag),
        FieldValue::Int(number) => Cell::Int(*number),
        FieldValue::Float(number) => Cell::Float(*number),
        FieldValue::Text(text) => Cell::Text(text.clone()),
        FieldValue::Timestamp(timestamp) => Cell::Timestamp(timestamp.format_store()),
    }
}

fn from_row(schema: &SchemaSpec, row: RecordRow) -> Result<PersistedRecord, StoreError> {
    let timestamp = row
        .timestamp
        .as_deref()
        .map(|raw| stored_timestamp("timestamp", raw))
        .transpose()?;
    let level = row
        .level
        .as_deref()
        .map(|raw| {
            IntervalLevel::from_str(raw).map_err(|error| StoreError::Corrupt {
                field: String::from("level"),
                message: error.to_string(),
            })
        })
        .transpose()?;

    let mut record = PersistedRecord {
        id: row.id,
        entity_id: row.entity_id,
        code: row.code,
        timestamp,
        level,
        fields: Default::default(),
    };
    for (name, cell) in row.cells {
        let kind = schema.field(&name).map_or(FieldKind::Text, |field| field.kind);
        let value = from_cell(&name, cell, kind)?;
        record.set_field(name, value);
    }
    Ok(record)
}

fn from_cell(name: &str, cell: Cell, kind: FieldKind) -> Result<FieldValue, StoreError> {
    Ok(match (cell, kind) {
        (Cell::Null, _) => FieldValue::Null,
        (Cell::Bool(flag), _) => FieldValue::Bool(flag),
        (Cell::Int(number), FieldKind::Float) => FieldValue::Float(number as f64),
        (Cell::Int(number), _) => FieldValue::Int(number),
        (Cell::Float(number), _) => FieldValue::Float(number),
        (Cell::Timestamp(raw), _) => FieldValue::Timestamp(stored_timestamp(name, &raw)?),
        (Cell::Text(text), _) => FieldValue::Text(text),
    })
}

fn stored_timestamp(field: &str, raw: &str) -> Result<Timestamp, StoreError> {
    Timestamp::parse_naive(raw).map_err(|error| StoreError::Corrupt {
        field: field.to_string(),
        message: error.to_string(),
    })
}

fn entity_row(entity: &Entity) -> EntityRow {
    EntityRow {
        id: entity.id.clone(),
        entity_type: entity.entity_type.as_str().to_string(),
        exchange: entity.exchange.clone(),
        code: entity.code.clone(),
        name: entity.name.clone(),
        inception: entity.inception.map(Timestamp::format_store),
    }
}

fn entity_from_row(row: EntityRow) -> Result<Entity, StoreError> {
    let corrupt = |field: &str, message: String| StoreError::Corrupt {
        field: field.to_string(),
        message,
    };
    let entity_type =
        EntityType::from_str(&row.entity_type).map_err(|error| corrupt("entity_type", error.to_string()))?;
    let mut entity = Entity::new(entity_type, &row.exchange, &row.code)
        .map_err(|error| corrupt("id", error.to_string()))?;
    if entity.id != row.id {
        return Err(corrupt(
            "id",
            format!("'{}' does not match {{type}}_{{exchange}}_{{code}}", row.id),
        ));
    }
    entity.name = row.name;
    entity.inception = row
        .inception
        .as_deref()
        .map(|raw| stored_timestamp("inception", raw))
        .transpose()?;
    Ok(entity)
}
