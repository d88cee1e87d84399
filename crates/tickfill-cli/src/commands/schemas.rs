use serde_json::json;
use tickfill_core::SchemaRegistry;

use crate::cli::{SchemasArgs, SchemasCommand};
use crate::error::CliError;

use super::CommandResult;

pub fn run(args: &SchemasArgs) -> Result<CommandResult, CliError> {
    let registry = SchemaRegistry::builtin();
    match &args.command {
        SchemasCommand::List => {
            let mut schemas = registry
                .iter()
                .map(|schema| {
                    json!({
                        "id": schema.id,
                        "cadence": schema.cadence,
                        "field_count": schema.fields.len(),
                    })
                })
                .collect::<Vec<_>>();
            schemas.sort_by(|a, b| a["id"].as_str().cmp(&b["id"].as_str()));
            Ok(CommandResult::ok(json!({ "schemas": schemas })))
        }
        SchemasCommand::Get(get) => {
            let schema = registry
                .get(get.id.trim())
                .ok_or_else(|| CliError::Command(format!("unknown schema '{}'", get.id.trim())))?;
            Ok(CommandResult::ok(serde_json::to_value(schema)?))
        }
    }
}
