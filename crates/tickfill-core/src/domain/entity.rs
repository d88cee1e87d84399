use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::domain::Timestamp;
use crate::ValidationError;

/// Kind of tracked subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Stock,
    Index,
    Coin,
    Etf,
}

impl EntityType {
    pub const ALL: [Self; 4] = [Self::Stock, Self::Index, Self::Coin, Self::Etf];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stock => "stock",
            Self::Index => "index",
            Self::Coin => "coin",
            Self::Etf => "etf",
        }
    }
}

impl Display for EntityType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|entity_type| entity_type.as_str() == normalized)
            .ok_or(ValidationError::InvalidEntityType {
                value: value.trim().to_owned(),
            })
    }
}

/// A tracked tradable subject. Read-only to the sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub entity_type: EntityType,
    pub exchange: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inception: Option<Timestamp>,
}

impl Entity {
    /// Build an entity with id `{type}_{exchange}_{code}`. Exchange and code
    /// are lowercased.
    pub fn new(
        entity_type: EntityType,
        exchange: &str,
        code: &str,
    ) -> Result<Self, ValidationError> {
        let exchange = exchange.trim().to_ascii_lowercase();
        if exchange.is_empty() {
            return Err(ValidationError::EmptyExchange);
        }
        if let Some((index, ch)) = exchange
            .chars()
            .enumerate()
            .find(|(_, ch)| !ch.is_ascii_alphanumeric())
        {
            return Err(ValidationError::CodeInvalidChar { ch, index });
        }

        let code = normalize_code(code)?;
        Ok(Self {
            id: format!("{}_{}_{}", entity_type.as_str(), exchange, code),
            entity_type,
            exchange,
            code,
            name: None,
            inception: None,
        })
    }

    /// Decode `{type}_{exchange}_{code}`.
    pub fn parse_id(id: &str) -> Result<Self, ValidationError> {
        let invalid = || ValidationError::InvalidEntityId {
            value: id.to_owned(),
        };
        let mut parts = id.trim().splitn(3, '_');
        let (Some(entity_type), Some(exchange), Some(code)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };

        let entity_type = EntityType::from_str(entity_type).map_err(|_| invalid())?;
        Self::new(entity_type, exchange, code)
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_inception(mut self, inception: Timestamp) -> Self {
        self.inception = Some(inception);
        self
    }
}

impl Display for Entity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.id)
    }
}

fn normalize_code(input: &str) -> Result<String, ValidationError> {
    let code = input.trim().to_ascii_lowercase();
    if code.is_empty() {
        return Err(ValidationError::EmptyCode);
    }

    for (index, ch) in code.chars().enumerate() {
        let valid = ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_' | '/');
        if !valid {
            return Err(ValidationError::CodeInvalidChar { ch, index });
        }
    }

    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_id_from_parts() {
        let entity = Entity::new(EntityType::Stock, "SZ", "000338").expect("entity");
        assert_eq!(entity.id, "stock_sz_000338");
    }

    #[test]
    fn parses_id_with_underscored_code() {
        let entity = Entity::parse_id("coin_binance_btc_usdt").expect("entity");
        assert_eq!(entity.entity_type, EntityType::Coin);
        assert_eq!(entity.exchange, "binance");
        assert_eq!(entity.code, "btc_usdt");
        assert_eq!(entity.id, "coin_binance_btc_usdt");
    }

    #[test]
    fn rejects_malformed_ids() {
        assert!(matches!(
            Entity::parse_id("stock_sz"),
            Err(ValidationError::InvalidEntityId { .. })
        ));
        assert!(matches!(
            Entity::parse_id("bond_sz_000338"),
            Err(ValidationError::InvalidEntityId { .. })
        ));
        assert!(matches!(
            Entity::new(EntityType::Stock, "sz", "00 338"),
            Err(ValidationError::CodeInvalidChar { ch: ' ', .. })
        ));
    }
}
