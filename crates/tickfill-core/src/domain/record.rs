use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::{IntervalLevel, Timestamp};

/// Provider-native record: field name to JSON value.
pub type RawRecord = serde_json::Map<String, serde_json::Value>;

/// A typed schema field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Timestamp(Timestamp),
    Text(String),
}

impl FieldValue {
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(value) => Some(*value as f64),
            Self::Float(value) => Some(*value),
            _ => None,
        }
    }
}

/// Canonical record ready for the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub id: String,
    pub entity_id: String,
    pub code: String,
    pub timestamp: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<IntervalLevel>,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
}

impl PersistedRecord {
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: FieldValue) {
        self.fields.insert(name.into(), value);
    }
}
