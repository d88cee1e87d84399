//! Provider field to schema field mapping.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::UtcOffset;

use crate::domain::{FieldValue, Timestamp};
use crate::schema::FieldKind;

/// Conversion applied to a raw value before it lands in a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "factor", rename_all = "snake_case")]
pub enum Transform {
    /// Coerce to the target field's kind.
    Identity,
    Float,
    Int,
    Text,
    Bool,
    Timestamp,
    /// Multiply a numeric value by a factor (e.g. 1e8 for amounts quoted in units of 100M).
    Scale(f64),
    /// Divide a numeric value by 100.
    Percent,
}

impl Transform {
    /// Apply the transform and coerce the result to `kind`.
    pub fn apply(self, value: &Value, kind: FieldKind, offset: UtcOffset) -> Result<FieldValue, String> {
        let converted = match self {
            Self::Identity => return coerce(value, kind, offset),
            Self::Float => coerce(value, FieldKind::Float, offset)?,
            Self::Int => coerce(value, FieldKind::Int, offset)?,
            Self::Text => coerce(value, FieldKind::Text, offset)?,
            Self::Bool => coerce(value, FieldKind::Bool, offset)?,
            Self::Timestamp => coerce(value, FieldKind::Timestamp, offset)?,
            Self::Scale(factor) => scale(coerce(value, FieldKind::Float, offset)?, factor),
            Self::Percent => scale(coerce(value, FieldKind::Float, offset)?, 0.01),
        };
        recoerce(converted, kind)
    }
}

fn scale(value: FieldValue, factor: f64) -> FieldValue {
    match value {
        FieldValue::Float(number) => FieldValue::Float(number * factor),
        other => other,
    }
}

/// One `raw → (target, transform)` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub source: String,
    pub target: String,
    #[serde(default = "identity")]
    pub transform: Transform,
}

const fn identity() -> Transform {
    Transform::Identity
}

/// How raw records of one provider map onto a schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMap {
    /// Raw field holding the record timestamp.
    #[serde(default = "default_timestamp_field")]
    pub timestamp_field: String,
    /// Raw field holding an authoritative external id, used verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_field: Option<String>,
    #[serde(default)]
    pub entries: Vec<FieldMapping>,
}

fn default_timestamp_field() -> String {
    String::from("timestamp")
}

impl Default for FieldMap {
    fn default() -> Self {
        Self {
            timestamp_field: default_timestamp_field(),
            id_field: None,
            entries: Vec::new(),
        }
    }
}

impl FieldMap {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_timestamp_field(mut self, field: impl Into<String>) -> Self {
        self.timestamp_field = field.into();
        self
    }

    #[must_use]
    pub fn with_id_field(mut self, field: impl Into<String>) -> Self {
        self.id_field = Some(field.into());
        self
    }

    #[must_use]
    pub fn map(mut self, source: impl Into<String>, target: impl Into<String>, transform: Transform) -> Self {
        self.entries.push(FieldMapping {
            source: source.into(),
            target: target.into(),
            transform,
        });
        self
    }

    /// True when some entry writes `target`.
    pub fn targets(&self, target: &str) -> bool {
        self.entries.iter().any(|entry| entry.target == target)
    }
}

/// Coerce a JSON value to `kind`. Null, empty strings and placeholder dashes
/// read as [`FieldValue::Null`].
pub fn coerce(value: &Value, kind: FieldKind, offset: UtcOffset) -> Result<FieldValue, String> {
    if is_blank(value) {
        return Ok(FieldValue::Null);
    }

    match kind {
        FieldKind::Float => number(value).map(FieldValue::Float),
        FieldKind::Int => match value {
            Value::Number(number) if number.is_i64() => Ok(FieldValue::Int(number.as_i64().unwrap_or_default())),
            _ => number(value).and_then(|float| {
                if float.fract() == 0.0 && float.abs() < 9.0e15 {
                    Ok(FieldValue::Int(float as i64))
                } else {
                    Err(format!("{value} is not an integer"))
                }
            }),
        },
        FieldKind::Text => Ok(FieldValue::Text(match value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        })),
        FieldKind::Bool => match value {
            Value::Bool(flag) => Ok(FieldValue::Bool(*flag)),
            Value::Number(number) => Ok(FieldValue::Bool(number.as_f64().is_some_and(|n| n != 0.0))),
            Value::String(text) => match text.trim().to_ascii_lowercase().as_str() {
                "true" | "t" | "yes" | "y" | "1" => Ok(FieldValue::Bool(true)),
                "false" | "f" | "no" | "n" | "0" => Ok(FieldValue::Bool(false)),
                _ => Err(format!("'{text}' is not a boolean")),
            },
            other => Err(format!("{other} is not a boolean")),
        },
        FieldKind::Timestamp => parse_timestamp(value, offset)
            .map(FieldValue::Timestamp)
            .map_err(|error| error.to_string()),
    }
}

/// Read a timestamp from a JSON string or epoch number.
pub fn parse_timestamp(value: &Value, offset: UtcOffset) -> Result<Timestamp, crate::TimestampParseError> {
    match value {
        Value::String(text) => Timestamp::parse(text, offset),
        Value::Number(number) => match number.as_i64() {
            Some(epoch) => Timestamp::from_epoch(epoch, offset),
            None => Err(crate::TimestampParseError {
                value: number.to_string(),
            }),
        },
        other => Err(crate::TimestampParseError {
            value: other.to_string(),
        }),
    }
}

fn recoerce(value: FieldValue, kind: FieldKind) -> Result<FieldValue, String> {
    match (value, kind) {
        (FieldValue::Null, _) => Ok(FieldValue::Null),
        (FieldValue::Int(number), FieldKind::Float) => Ok(FieldValue::Float(number as f64)),
        (FieldValue::Float(number), FieldKind::Int) if number.fract() == 0.0 => Ok(FieldValue::Int(number as i64)),
        (FieldValue::Float(number), FieldKind::Text) => Ok(FieldValue::Text(number.to_string())),
        (FieldValue::Int(number), FieldKind::Text) => Ok(FieldValue::Text(number.to_string())),
        (FieldValue::Bool(flag), FieldKind::Text) => Ok(FieldValue::Text(flag.to_string())),
        (FieldValue::Timestamp(ts), FieldKind::Text) => Ok(FieldValue::Text(ts.to_string())),
        (value @ FieldValue::Float(_), FieldKind::Float)
        | (value @ FieldValue::Int(_), FieldKind::Int)
        | (value @ FieldValue::Text(_), FieldKind::Text)
        | (value @ FieldValue::Bool(_), FieldKind::Bool)
        | (value @ FieldValue::Timestamp(_), FieldKind::Timestamp) => Ok(value),
        (value, kind) => Err(format!("cannot store {value:?} as {kind:?}")),
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => matches!(text.trim(), "" | "-" | "--" | "None" | "null" | "NaN"),
        Value::Number(number) => number.as_f64().is_some_and(f64::is_nan),
        _ => false,
    }
}

fn number(value: &Value) -> Result<f64, String> {
    match value {
        Value::Number(number) => number
            .as_f64()
            .ok_or_else(|| format!("{number} is not representable as f64")),
        Value::String(text) => {
            let cleaned = text.trim().replace(',', "");
            let (digits, percent) = match cleaned.strip_suffix('%') {
                Some(digits) => (digits.to_string(), true),
                None => (cleaned, false),
            };
            digits
                .parse::<f64>()
                .map(|parsed| if percent { parsed / 100.0 } else { parsed })
                .map_err(|_| format!("'{text}' is not a number"))
        }
        Value::Bool(flag) => Ok(if *flag { 1.0 } else { 0.0 }),
        other => Err(format!("{other} is not a number")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_strings_and_placeholders_coerce() {
        let utc = UtcOffset::UTC;
        assert_eq!(coerce(&json!("1,234.5"), FieldKind::Float, utc), Ok(FieldValue::Float(1234.5)));
        assert_eq!(coerce(&json!("--"), FieldKind::Float, utc), Ok(FieldValue::Null));
        assert_eq!(coerce(&json!(3), FieldKind::Float, utc), Ok(FieldValue::Float(3.0)));
        assert_eq!(coerce(&json!("7"), FieldKind::Int, utc), Ok(FieldValue::Int(7)));
        assert!(coerce(&json!("abc"), FieldKind::Float, utc).is_err());
    }

    #[test]
    fn scale_and_percent_transforms() {
        let utc = UtcOffset::UTC;
        assert_eq!(
            Transform::Scale(100_000_000.0).apply(&json!(1.5), FieldKind::Float, utc),
            Ok(FieldValue::Float(150_000_000.0))
        );
        assert_eq!(
            Transform::Percent.apply(&json!("2.5"), FieldKind::Float, utc),
            Ok(FieldValue::Float(0.025))
        );
    }

    #[test]
    fn timestamp_transform_reads_epochs() {
        let value = Transform::Timestamp
            .apply(&json!(1_578_182_400), FieldKind::Timestamp, UtcOffset::UTC)
            .expect("timestamp");
        assert!(matches!(value, FieldValue::Timestamp(ts) if ts.format_day() == "2020-01-05"));
    }
}
