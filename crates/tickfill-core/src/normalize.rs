//! Raw record to canonical record conversion.

use std::collections::HashSet;

use serde_json::Value;
use tracing::{info, warn};

use crate::domain::{Entity, FieldValue, PersistedRecord, RawRecord, SessionRules, Timestamp};
use crate::field_map::{coerce, parse_timestamp, FieldMap};
use crate::schema::SchemaSpec;
use crate::store::Store;
use crate::{MappingError, NormalizeError};

/// Normalizes records of one schema. Existing rows are looked up through the
/// store so that re-fetched records are skipped or updated in place.
pub struct Normalizer<'a> {
    store: &'a dyn Store,
    schema: &'a SchemaSpec,
    field_map: &'a FieldMap,
}

impl<'a> Normalizer<'a> {
    pub fn new(store: &'a dyn Store, schema: &'a SchemaSpec, field_map: &'a FieldMap) -> Self {
        Self {
            store,
            schema,
            field_map,
        }
    }

    /// Returns `Ok(None)` when the record already exists and `force_update`
    /// is off.
    pub fn normalize(
        &self,
        entity: &Entity,
        raw: &RawRecord,
        force_update: bool,
    ) -> Result<Option<PersistedRecord>, NormalizeError> {
        let offset = SessionRules::for_entity(entity).offset;
        let raw_timestamp = raw.get(&self.field_map.timestamp_field);
        let timestamp = match raw_timestamp {
            None | Some(Value::Null) => None,
            Some(value) => match parse_timestamp(value, offset) {
                Ok(timestamp) => Some(timestamp),
                Err(error) => {
                    warn!(entity_id = %entity.id, error = %error, "record timestamp unreadable, storing null");
                    None
                }
            },
        };

        let id = self.record_id(entity, raw, timestamp, raw_timestamp);
        let mut record = match self.store.find(self.schema, &entity.id, &id)? {
            Some(_) if !force_update => {
                info!(entity_id = %entity.id, id = %id, "record exists, skipping");
                return Ok(None);
            }
            // Updates keep the stored id, entity id and timestamp.
            Some(existing) => existing,
            None => PersistedRecord {
                id,
                entity_id: entity.id.clone(),
                code: entity.code.clone(),
                timestamp,
                level: self.schema.level(),
                fields: Default::default(),
            },
        };

        self.apply_fields(entity, raw, &mut record)?;
        Ok(Some(record))
    }

    fn record_id(
        &self,
        entity: &Entity,
        raw: &RawRecord,
        timestamp: Option<Timestamp>,
        raw_timestamp: Option<&Value>,
    ) -> String {
        let external = self
            .field_map
            .id_field
            .as_ref()
            .and_then(|field| raw.get(field))
            .and_then(value_text);
        if let Some(external) = external {
            return external;
        }

        match timestamp {
            Some(timestamp) if self.schema.uses_day_ids() => {
                format!("{}_{}", entity.id, timestamp.format_day())
            }
            Some(timestamp) => format!("{}_{}", entity.id, timestamp.format_precise()),
            None => {
                let suffix = raw_timestamp.and_then(value_text).unwrap_or_else(|| String::from("none"));
                format!("{}_{suffix}", entity.id)
            }
        }
    }

    fn apply_fields(
        &self,
        entity: &Entity,
        raw: &RawRecord,
        record: &mut PersistedRecord,
    ) -> Result<(), MappingError> {
        let offset = SessionRules::for_entity(entity).offset;
        // Fields the raw record carried a value for, readable or not.
        let mut provided = HashSet::new();

        for entry in &self.field_map.entries {
            let Some(field) = self.schema.field(&entry.target) else {
                warn!(schema = %self.schema.id, target = %entry.target, "mapping targets unknown field");
                continue;
            };
            let Some(value) = raw.get(&entry.source).filter(|value| !value.is_null()) else {
                continue;
            };
            provided.insert(field.name.as_str());
            let converted = entry
                .transform
                .apply(value, field.kind, offset)
                .unwrap_or_else(|error| {
                    warn!(id = %record.id, field = %field.name, error = %error, "field conversion failed");
                    field.default.clone().unwrap_or(FieldValue::Null)
                });
            record.set_field(field.name.clone(), converted);
        }

        for field in &self.schema.fields {
            if self.field_map.targets(&field.name) {
                continue;
            }
            let Some(value) = raw.get(&field.name).filter(|value| !value.is_null()) else {
                continue;
            };
            provided.insert(field.name.as_str());
            let converted = coerce(value, field.kind, offset).unwrap_or_else(|error| {
                warn!(id = %record.id, field = %field.name, error = %error, "field conversion failed");
                field.default.clone().unwrap_or(FieldValue::Null)
            });
            record.set_field(field.name.clone(), converted);
        }

        for field in &self.schema.fields {
            if record.field(&field.name).is_some_and(|value| !value.is_null()) {
                continue;
            }
            match (&field.default, field.required) {
                (Some(default), _) => record.set_field(field.name.clone(), default.clone()),
                (None, true) if !provided.contains(field.name.as_str()) => {
                    return Err(MappingError::MissingRequiredField {
                        schema: self.schema.id.clone(),
                        field: field.name.clone(),
                        record_id: record.id.clone(),
                    })
                }
                (None, _) => record.set_field(field.name.clone(), FieldValue::Null),
            }
        }

        Ok(())
    }
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EntityType, IntervalLevel};
    use crate::field_map::Transform;
    use crate::schema::{kdata_schema, SchemaRegistry};
    use crate::store::MemoryStore;
    use serde_json::json;

    fn raw(value: Value) -> RawRecord {
        match value {
            Value::Object(map) => map,
            _ => RawRecord::new(),
        }
    }

    fn stock() -> Entity {
        Entity::parse_id("stock_sz_000338").expect("entity")
    }

    #[test]
    fn daily_ids_use_the_day() {
        let store = MemoryStore::new();
        let schema = kdata_schema(EntityType::Stock, IntervalLevel::OneDay);
        let map = FieldMap::new();
        let normalizer = Normalizer::new(&store, &schema, &map);

        let record = normalizer
            .normalize(
                &stock(),
                &raw(json!({"timestamp": "2020-01-02", "open": 1, "high": 2, "low": 0.5, "close": "1.5"})),
                false,
            )
            .expect("normalize")
            .expect("new record");

        assert_eq!(record.id, "stock_sz_000338_2020-01-02");
        assert_eq!(record.level, Some(IntervalLevel::OneDay));
        assert_eq!(record.field("close"), Some(&FieldValue::Float(1.5)));
        assert_eq!(record.field("volume"), Some(&FieldValue::Null));
    }

    #[test]
    fn intraday_ids_use_the_precise_time() {
        let store = MemoryStore::new();
        let schema = kdata_schema(EntityType::Stock, IntervalLevel::FiveMinutes);
        let map = FieldMap::new();
        let normalizer = Normalizer::new(&store, &schema, &map);

        let record = normalizer
            .normalize(
                &stock(),
                &raw(json!({"timestamp": "2020-01-02 09:35", "open": 1, "high": 2, "low": 0.5, "close": 1})),
                false,
            )
            .expect("normalize")
            .expect("new record");
        assert_eq!(record.id, "stock_sz_000338_2020-01-02T09:35:00");
    }

    #[test]
    fn existing_records_are_skipped_unless_forced() {
        let store = MemoryStore::new();
        let schema = kdata_schema(EntityType::Stock, IntervalLevel::OneDay);
        let map = FieldMap::new();
        let normalizer = Normalizer::new(&store, &schema, &map);
        let input = raw(json!({"timestamp": "2020-01-02", "open": 1, "high": 2, "low": 0.5, "close": 1}));

        let first = normalizer.normalize(&stock(), &input, false).expect("normalize").expect("new");
        store.upsert(&schema, &[first]).expect("upsert");

        assert!(normalizer.normalize(&stock(), &input, false).expect("normalize").is_none());

        let updated = raw(json!({"timestamp": "2020-01-02T00:00:00+08:00", "close": 9}));
        let forced = normalizer.normalize(&stock(), &updated, true).expect("normalize").expect("forced");
        assert_eq!(forced.id, "stock_sz_000338_2020-01-02");
        assert_eq!(forced.field("close"), Some(&FieldValue::Float(9.0)));
    }

    #[test]
    fn missing_required_field_is_a_mapping_error() {
        let store = MemoryStore::new();
        let schema = kdata_schema(EntityType::Stock, IntervalLevel::OneDay);
        let map = FieldMap::new();
        let normalizer = Normalizer::new(&store, &schema, &map);

        let error = normalizer
            .normalize(&stock(), &raw(json!({"timestamp": "2020-01-02", "open": 1})), false)
            .expect_err("missing close");
        assert!(matches!(
            error,
            NormalizeError::Mapping(MappingError::MissingRequiredField { ref field, .. }) if field == "close"
        ));
    }

    #[test]
    fn unreadable_required_field_degrades_to_null() {
        let store = MemoryStore::new();
        let schema = kdata_schema(EntityType::Stock, IntervalLevel::OneDay);
        let map = FieldMap::new();
        let normalizer = Normalizer::new(&store, &schema, &map);

        let record = normalizer
            .normalize(&stock(), &raw(json!({"timestamp": "2020-01-02", "close": "abc"})), false)
            .expect("normalize")
            .expect("record kept");
        assert_eq!(record.field("close"), Some(&FieldValue::Null));
    }

    #[test]
    fn null_required_field_counts_as_absent() {
        let store = MemoryStore::new();
        let schema = kdata_schema(EntityType::Stock, IntervalLevel::OneDay);
        let map = FieldMap::new();
        let normalizer = Normalizer::new(&store, &schema, &map);

        let error = normalizer
            .normalize(&stock(), &raw(json!({"timestamp": "2020-01-02", "close": null})), false)
            .expect_err("close is null");
        assert!(matches!(error, NormalizeError::Mapping(_)));
    }

    #[test]
    fn unreadable_timestamp_degrades_to_null() {
        let store = MemoryStore::new();
        let registry = SchemaRegistry::builtin();
        let schema = registry.get("gdp").expect("gdp schema");
        let map = FieldMap::new();
        let normalizer = Normalizer::new(&store, schema, &map);

        let record = normalizer
            .normalize(&stock(), &raw(json!({"timestamp": "someday", "value": 3})), false)
            .expect("normalize")
            .expect("record");
        assert_eq!(record.timestamp, None);
        assert_eq!(record.id, "stock_sz_000338_someday");
    }

    #[test]
    fn field_map_renames_and_scales() {
        let store = MemoryStore::new();
        let registry = SchemaRegistry::builtin();
        let schema = registry.get("cross_market_summary").expect("schema");
        let map = FieldMap::new()
            .with_timestamp_field("day")
            .map("buyAmt", "buy_amount", Transform::Scale(100_000_000.0));
        let normalizer = Normalizer::new(&store, schema, &map);

        let record = normalizer
            .normalize(&stock(), &raw(json!({"day": "2020-01-02", "buyAmt": "1.5"})), false)
            .expect("normalize")
            .expect("record");
        assert_eq!(record.field("buy_amount"), Some(&FieldValue::Float(150_000_000.0)));
    }

    #[test]
    fn external_id_is_used_verbatim() {
        let store = MemoryStore::new();
        let registry = SchemaRegistry::builtin();
        let schema = registry.get("finance_report").expect("schema");
        let map = FieldMap::new().with_id_field("report_id");
        let normalizer = Normalizer::new(&store, schema, &map);

        let record = normalizer
            .normalize(&stock(), &raw(json!({"timestamp": "2020-03-31", "report_id": "R-77"})), false)
            .expect("normalize")
            .expect("record");
        assert_eq!(record.id, "R-77");
    }
}
