use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use tickfill_core::{Entity, EntityCatalog, EntityQuery, EntityType, Timestamp, WarehouseStore};
use tickfill_warehouse::Warehouse;

use crate::cli::{EntitiesArgs, EntitiesCommand};
use crate::error::CliError;

use super::CommandResult;

pub fn run(args: &EntitiesArgs, warehouse: &Arc<Warehouse>) -> Result<CommandResult, CliError> {
    let store = WarehouseStore::new(Arc::clone(warehouse));
    match &args.command {
        EntitiesCommand::Import(import) => {
            let raw = std::fs::read_to_string(&import.path)?;
            let entities = serde_json::from_str::<Vec<EntityInput>>(&raw)?
                .into_iter()
                .map(EntityInput::into_entity)
                .collect::<Result<Vec<_>, _>>()?;
            let written = store.import_entities(&entities)?;
            Ok(CommandResult::ok(json!({ "imported": written })))
        }
        EntitiesCommand::List(list) => {
            let query = EntityQuery {
                entity_type: list
                    .entity_type
                    .as_deref()
                    .map(EntityType::from_str)
                    .transpose()?,
                exchanges: list.exchanges.iter().map(|e| e.trim().to_ascii_lowercase()).collect(),
                ..EntityQuery::default()
            };
            let entities = store.list(&query)?;
            Ok(CommandResult::ok(json!({
                "count": entities.len(),
                "entities": entities,
            })))
        }
    }
}

/// One catalog entry in an import file. The id is derived.
#[derive(Debug, Deserialize)]
struct EntityInput {
    entity_type: EntityType,
    exchange: String,
    code: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    inception: Option<Timestamp>,
}

impl EntityInput {
    fn into_entity(self) -> Result<Entity, CliError> {
        let mut entity = Entity::new(self.entity_type, &self.exchange, &self.code)?;
        entity.name = self.name;
        entity.inception = self.inception;
        Ok(entity)
    }
}
