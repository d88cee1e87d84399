mod entities;
mod schemas;
mod sql;
mod sync;

use std::sync::Arc;

use serde_json::Value;
use tickfill_warehouse::{resolve_tickfill_home, Warehouse, WarehouseConfig};

use crate::cli::{Cli, Command};
use crate::error::CliError;
use crate::output::Envelope;

pub struct CommandResult {
    pub data: Value,
    pub warnings: Vec<String>,
}

impl CommandResult {
    pub fn ok(data: Value) -> Self {
        Self {
            data,
            warnings: Vec::new(),
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}

pub async fn run(cli: &Cli) -> Result<Envelope, CliError> {
    let (command, result) = match &cli.command {
        Command::Sync(args) => ("sync", sync::run(args, &open_warehouse(cli)?).await?),
        Command::Entities(args) => ("entities", entities::run(args, &open_warehouse(cli)?)?),
        Command::Schemas(args) => ("schemas", schemas::run(args)?),
        Command::Sql(args) => ("sql", sql::run(args, &*open_warehouse(cli)?)?),
    };

    Envelope::new(command, result.data, result.warnings)
}

fn open_warehouse(cli: &Cli) -> Result<Arc<Warehouse>, CliError> {
    let home = cli.home.clone().unwrap_or_else(resolve_tickfill_home);
    Ok(Arc::new(Warehouse::open(WarehouseConfig::under(home))?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use serde_json::json;
    use tempfile::tempdir;

    fn cli(home: &std::path::Path, args: &[&str]) -> Cli {
        let mut argv = vec!["tickfill", "--home", home.to_str().expect("utf-8 path")];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).expect("parse")
    }

    #[tokio::test]
    async fn fixture_sync_then_sql_sees_the_records() {
        let temp = tempdir().expect("tempdir");
        let fixture = temp.path().join("bars.json");
        std::fs::write(
            &fixture,
            json!({
                "stock_sz_000338": [
                    {"timestamp": "2020-01-02", "close": 10.0},
                    {"timestamp": "2020-01-03", "close": 10.5}
                ]
            })
            .to_string(),
        )
        .expect("write fixture");

        let sync = run(&cli(
            temp.path(),
            &[
                "sync",
                "stock_1d_kdata",
                "--entity",
                "stock_sz_000338",
                "--fixture",
                fixture.to_str().expect("utf-8 path"),
                "--one-shot",
            ],
        ))
        .await
        .expect("sync");
        assert_eq!(sync.meta.command, "sync");
        assert_eq!(sync.data["persisted"], json!(2));

        let sql = run(&cli(
            temp.path(),
            &["sql", "SELECT id FROM stock_1d_kdata ORDER BY id"],
        ))
        .await
        .expect("sql");
        assert_eq!(sql.data["row_count"], json!(2));
        assert_eq!(sql.data["rows"][0][0], json!("stock_sz_000338_2020-01-02"));
    }

    #[tokio::test]
    async fn unknown_schema_is_a_command_error() {
        let temp = tempdir().expect("tempdir");
        let error = run(&cli(temp.path(), &["sync", "nope", "--fixture", "x.json"]))
            .await
            .err()
            .expect("unknown schema");
        assert_eq!(error.exit_code(), 2);
    }

    #[tokio::test]
    async fn net_value_backfill_reads_the_net_value_file() {
        let temp = tempdir().expect("tempdir");
        let bars = temp.path().join("bars.json");
        std::fs::write(
            &bars,
            json!({
                "etf_sh_510300": [
                    {"timestamp": "2020-01-02", "close": 4.1},
                    {"timestamp": "2020-01-03", "close": 4.2}
                ]
            })
            .to_string(),
        )
        .expect("write bars");
        let net_values = temp.path().join("net_values.json");
        std::fs::write(
            &net_values,
            json!({
                "etf_sh_510300": [
                    {"timestamp": "2020-01-02", "cumulative_net_value": 1.5, "change_pct": 0.3}
                ]
            })
            .to_string(),
        )
        .expect("write net values");

        run(&cli(
            temp.path(),
            &[
                "sync",
                "etf_1d_kdata",
                "--entity",
                "etf_sh_510300",
                "--fixture",
                bars.to_str().expect("utf-8 path"),
                "--one-shot",
                "--backfill",
                "cumulative-net-value",
                "--net-values",
                net_values.to_str().expect("utf-8 path"),
            ],
        ))
        .await
        .expect("sync");

        let sql = run(&cli(
            temp.path(),
            &["sql", "SELECT cumulative_net_value FROM etf_1d_kdata ORDER BY id"],
        ))
        .await
        .expect("sql");
        assert_eq!(sql.data["rows"][0][0], json!(1.5));
        assert_eq!(sql.data["rows"][1][0], json!(null));
    }

    #[tokio::test]
    async fn net_value_backfill_without_a_source_is_a_command_error() {
        let temp = tempdir().expect("tempdir");
        let bars = temp.path().join("bars.json");
        std::fs::write(&bars, "{}").expect("write bars");
        let error = run(&cli(
            temp.path(),
            &[
                "sync",
                "etf_1d_kdata",
                "--fixture",
                bars.to_str().expect("utf-8 path"),
                "--backfill",
                "cumulative-net-value",
            ],
        ))
        .await
        .err()
        .expect("missing net value source");
        assert_eq!(error.exit_code(), 2);
    }
}
