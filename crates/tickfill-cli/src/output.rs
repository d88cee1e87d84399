use serde::Serialize;
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::cli::OutputFormat;
use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct Meta {
    pub request_id: String,
    pub command: &'static str,
    pub generated_at: String,
    pub warnings: Vec<String>,
}

/// Top-level document written to stdout by every command.
#[derive(Debug, Serialize)]
pub struct Envelope {
    pub meta: Meta,
    pub data: Value,
}

impl Envelope {
    pub fn new(command: &'static str, data: Value, warnings: Vec<String>) -> Result<Self, CliError> {
        let generated_at = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .map_err(|error| CliError::Command(format!("failed to format timestamp: {error}")))?;
        Ok(Self {
            meta: Meta {
                request_id: Uuid::new_v4().to_string(),
                command,
                generated_at,
                warnings,
            },
            data,
        })
    }
}

pub fn render(envelope: &Envelope, format: OutputFormat, pretty: bool) -> Result<(), CliError> {
    match format {
        OutputFormat::Json => {
            let payload = if pretty {
                serde_json::to_string_pretty(envelope)?
            } else {
                serde_json::to_string(envelope)?
            };
            println!("{payload}");
        }
        OutputFormat::Table => render_table(envelope)?,
    }
    Ok(())
}

fn render_table(envelope: &Envelope) -> Result<(), CliError> {
    println!("request_id  : {}", envelope.meta.request_id);
    println!("command     : {}", envelope.meta.command);
    println!("generated_at: {}", envelope.meta.generated_at);

    if !envelope.meta.warnings.is_empty() {
        println!("warnings:");
        for warning in &envelope.meta.warnings {
            println!("  - {warning}");
        }
    }

    println!("data:");
    let pretty_data = serde_json::to_string_pretty(&envelope.data)?;
    for line in pretty_data.lines() {
        println!("  {line}");
    }
    Ok(())
}
