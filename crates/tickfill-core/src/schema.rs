//! Record schemas and the registry that resolves them by id.
//!
//! A schema names its table, how its cursor advances ([`Cadence`]) and the
//! typed fields a persisted record carries besides the key columns.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tickfill_warehouse::{ColumnDef, ColumnType, TableDef};

use crate::domain::{EntityType, FieldValue, IntervalLevel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Bool,
    Int,
    Float,
    Text,
    Timestamp,
}

impl FieldKind {
    pub const fn column_type(self) -> ColumnType {
        match self {
            Self::Bool => ColumnType::Boolean,
            Self::Int => ColumnType::BigInt,
            Self::Float => ColumnType::Double,
            Self::Text => ColumnType::Text,
            Self::Timestamp => ColumnType::Timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<FieldValue>,
}

impl FieldSpec {
    pub fn optional(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            default: None,
        }
    }

    pub fn required(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            required: true,
            ..Self::optional(name, kind)
        }
    }

    #[must_use]
    pub fn with_default(mut self, default: FieldValue) -> Self {
        self.default = Some(default);
        self
    }
}

/// How a schema's cursor advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "level", rename_all = "snake_case")]
pub enum Cadence {
    /// Continue from the latest record (or inception) with the default window.
    TimeSeries,
    /// Bars of a fixed level.
    FixedCycle(IntervalLevel),
    /// Records published at instants enumerated by a timestamp source.
    Announcement,
}

impl Cadence {
    pub const fn level(self) -> Option<IntervalLevel> {
        match self {
            Self::FixedCycle(level) => Some(level),
            Self::TimeSeries | Self::Announcement => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaSpec {
    pub id: String,
    pub table: String,
    pub cadence: Cadence,
    pub fields: Vec<FieldSpec>,
}

impl SchemaSpec {
    pub fn new(
        id: impl Into<String>,
        table: impl Into<String>,
        cadence: Cadence,
        fields: Vec<FieldSpec>,
    ) -> Self {
        Self {
            id: id.into(),
            table: table.into(),
            cadence,
            fields,
        }
    }

    pub const fn level(&self) -> Option<IntervalLevel> {
        self.cadence.level()
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// Ids use the precise timestamp only for sub-day levels.
    pub fn uses_day_ids(&self) -> bool {
        self.level()
            .map_or(true, |level| level.is_daily_or_coarser())
    }

    pub fn table_def(&self) -> TableDef {
        TableDef::new(
            self.table.clone(),
            self.fields
                .iter()
                .map(|field| ColumnDef::new(field.name.clone(), field.kind.column_type()))
                .collect(),
        )
    }
}

/// Schemas resolved at startup, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: BTreeMap<String, SchemaSpec>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in schema.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for entity_type in EntityType::ALL {
            for level in IntervalLevel::ALL {
                if level == IntervalLevel::Tick {
                    continue;
                }
                registry.register(kdata_schema(entity_type, level));
            }
        }
        registry.register(cross_market_summary_schema());
        registry.register(stock_summary_schema());
        registry.register(gdp_schema());
        registry.register(finance_report_schema());
        registry
    }

    /// Add or replace a schema.
    pub fn register(&mut self, schema: SchemaSpec) {
        self.schemas.insert(schema.id.clone(), schema);
    }

    pub fn get(&self, id: &str) -> Option<&SchemaSpec> {
        self.schemas.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SchemaSpec> {
        self.schemas.values()
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

pub fn kdata_schema_id(entity_type: EntityType, level: IntervalLevel) -> String {
    format!("{}_{}_kdata", entity_type.as_str(), level.as_str())
}

pub fn kdata_schema(entity_type: EntityType, level: IntervalLevel) -> SchemaSpec {
    let id = kdata_schema_id(entity_type, level);
    SchemaSpec::new(
        id.clone(),
        id,
        Cadence::FixedCycle(level),
        vec![
            FieldSpec::optional("name", FieldKind::Text),
            FieldSpec::optional("open", FieldKind::Float),
            FieldSpec::optional("high", FieldKind::Float),
            FieldSpec::optional("low", FieldKind::Float),
            FieldSpec::required("close", FieldKind::Float),
            FieldSpec::optional("volume", FieldKind::Float),
            FieldSpec::optional("turnover", FieldKind::Float),
            FieldSpec::optional("change_pct", FieldKind::Float),
            FieldSpec::optional("cumulative_net_value", FieldKind::Float),
        ],
    )
}

fn cross_market_summary_schema() -> SchemaSpec {
    SchemaSpec::new(
        "cross_market_summary",
        "cross_market_summary",
        Cadence::TimeSeries,
        vec![
            FieldSpec::optional("name", FieldKind::Text),
            FieldSpec::optional("buy_amount", FieldKind::Float),
            FieldSpec::optional("buy_volume", FieldKind::Float),
            FieldSpec::optional("sell_amount", FieldKind::Float),
            FieldSpec::optional("sell_volume", FieldKind::Float),
            FieldSpec::optional("quota_daily", FieldKind::Float),
            FieldSpec::optional("quota_daily_balance", FieldKind::Float),
        ],
    )
}

fn stock_summary_schema() -> SchemaSpec {
    SchemaSpec::new(
        "stock_summary",
        "stock_summary",
        Cadence::TimeSeries,
        vec![
            FieldSpec::optional("name", FieldKind::Text),
            FieldSpec::optional("total_value", FieldKind::Float),
            FieldSpec::optional("total_tradable_value", FieldKind::Float),
            FieldSpec::optional("pe", FieldKind::Float),
            FieldSpec::optional("volume", FieldKind::Float),
            FieldSpec::optional("turnover", FieldKind::Float),
            FieldSpec::optional("turnover_rate", FieldKind::Float),
        ],
    )
}

fn gdp_schema() -> SchemaSpec {
    SchemaSpec::new(
        "gdp",
        "gdp",
        Cadence::TimeSeries,
        vec![
            FieldSpec::optional("name", FieldKind::Text),
            FieldSpec::required("value", FieldKind::Float),
        ],
    )
}

fn finance_report_schema() -> SchemaSpec {
    SchemaSpec::new(
        "finance_report",
        "finance_report",
        Cadence::Announcement,
        vec![
            FieldSpec::optional("report_period", FieldKind::Text),
            FieldSpec::optional("report_date", FieldKind::Timestamp),
            FieldSpec::optional("total_revenue", FieldKind::Float),
            FieldSpec::optional("net_profit", FieldKind::Float),
            FieldSpec::optional("eps", FieldKind::Float),
        ],
    )
}
