//! CLI argument definitions for tickfill.
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `sync` | Bring one schema up to date for a set of entities |
//! | `entities` | Import or list catalog entities |
//! | `schemas` | List or show record schemas |
//! | `sql` | Query the local DuckDB warehouse |
//!
//! # Global Options
//!
//! | Option | Default | Description |
//! |--------|---------|-------------|
//! | `--format` | `json` | Output format (json, table) |
//! | `--pretty` | `false` | Pretty-print JSON output |
//! | `--strict` | `false` | Fail when warnings are present |
//! | `--home` | `$TICKFILL_HOME` | Directory holding the warehouse |
//!
//! # Examples
//!
//! ```bash
//! tickfill entities import entities.json
//! tickfill sync stock_1d_kdata --entity-type stock --fixture bars.json --one-shot
//! tickfill sync stock_1d_kdata --url "https://example.test/kline?code={code}&limit={size}" \
//!     --array-field data.klines --rename day=timestamp --every 300
//! tickfill sql "SELECT entity_id, count(*) FROM stock_1d_kdata GROUP BY 1"
//! ```

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Debug, Parser)]
#[command(
    name = "tickfill",
    author,
    version,
    about = "Incremental financial data sync into a local DuckDB warehouse"
)]
pub struct Cli {
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Json)]
    pub format: OutputFormat,

    /// Pretty-print JSON output with indentation.
    #[arg(long, global = true, default_value_t = false)]
    pub pretty: bool,

    /// Treat warnings as failures (exit code 5).
    #[arg(long, global = true, default_value_t = false)]
    pub strict: bool,

    /// Warehouse directory. Defaults to `TICKFILL_HOME`, then `~/.tickfill`.
    #[arg(long, global = true)]
    pub home: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Sync one schema until every selected entity is up to date.
    ///
    /// Entities come from `--entity` ids or from the catalog filtered by
    /// `--entity-type`, `--exchange` and `--code`. Records come from a JSON
    /// fixture (`--fixture`) or an HTTP JSON endpoint (`--url`).
    Sync(SyncArgs),

    /// Catalog management.
    Entities(EntitiesArgs),

    /// Record schema inspection.
    Schemas(SchemasArgs),

    /// Run SQL against the warehouse. Read-only unless --write is given.
    Sql(SqlArgs),
}

#[derive(Debug, Args)]
pub struct SyncArgs {
    /// Schema id, e.g. `stock_1d_kdata` or `gdp`.
    pub schema: String,

    /// Explicit entity ids (`{type}_{exchange}_{code}`), added to the catalog.
    #[arg(long = "entity", num_args = 1..)]
    pub entities: Vec<String>,

    #[arg(long)]
    pub entity_type: Option<String>,

    #[arg(long = "exchange", num_args = 1..)]
    pub exchanges: Vec<String>,

    #[arg(long = "code", num_args = 1..)]
    pub codes: Vec<String>,

    /// JSON file `{ "<entity_id>": [records] }` served as the source.
    #[arg(long, conflicts_with = "url")]
    pub fixture: Option<PathBuf>,

    /// URL template for an HTTP JSON source.
    #[arg(long)]
    pub url: Option<String>,

    /// Dotted path of the record array inside the response body.
    #[arg(long)]
    pub array_field: Option<String>,

    /// Provider field renames as `from=to`.
    #[arg(long = "rename", num_args = 1..)]
    pub renames: Vec<String>,

    /// Extra request headers as `name=value`.
    #[arg(long = "header", num_args = 1..)]
    pub headers: Vec<String>,

    /// Requests allowed per `--quota-window-secs`.
    #[arg(long, default_value_t = 60)]
    pub quota_limit: u32,

    #[arg(long, default_value_t = 60)]
    pub quota_window_secs: u64,

    /// JSON field map file.
    #[arg(long)]
    pub field_map: Option<PathBuf>,

    /// JSON file `{ "<entity_id>": ["<timestamp>", ...] }` for announcement schemas.
    #[arg(long)]
    pub timestamps: Option<PathBuf>,

    /// JSON sync config file. Flags below override its values.
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub batch_size: Option<usize>,

    #[arg(long)]
    pub default_size: Option<usize>,

    /// Seconds to sleep between fetches of one entity.
    #[arg(long)]
    pub pacing_secs: Option<f64>,

    #[arg(long)]
    pub timeout_secs: Option<f64>,

    #[arg(long)]
    pub max_cycles: Option<usize>,

    /// append-suffix or drop.
    #[arg(long)]
    pub duplicate_policy: Option<String>,

    /// retry-all or isolate-entity.
    #[arg(long)]
    pub failure_scope: Option<String>,

    #[arg(long, default_value_t = false)]
    pub one_shot: bool,

    #[arg(long, default_value_t = false)]
    pub force_update: bool,

    #[arg(long, default_value_t = false)]
    pub trim_unfinished: bool,

    /// Fill derived fields once an entity finishes: change-pct, cumulative-net-value.
    /// cumulative-net-value reads its figures from --net-values or --net-value-url.
    #[arg(long = "backfill", value_enum, num_args = 1..)]
    pub backfills: Vec<BackfillField>,

    /// JSON file `{ "<entity_id>": [net value records] }` for cumulative-net-value.
    #[arg(long, conflicts_with = "net_value_url")]
    pub net_values: Option<PathBuf>,

    /// URL template of a net value series for cumulative-net-value.
    #[arg(long)]
    pub net_value_url: Option<String>,

    #[arg(long, requires = "net_value_url")]
    pub net_value_array_field: Option<String>,

    /// Net value field renames as `from=to`.
    #[arg(long = "net-value-rename", num_args = 1.., requires = "net_value_url")]
    pub net_value_renames: Vec<String>,

    /// Repeat the sync every N seconds until interrupted.
    #[arg(long)]
    pub every: Option<u64>,

    /// Stop repeating after this many runs.
    #[arg(long, requires = "every")]
    pub max_runs: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackfillField {
    ChangePct,
    CumulativeNetValue,
}

#[derive(Debug, Args)]
pub struct EntitiesArgs {
    #[command(subcommand)]
    pub command: EntitiesCommand,
}

#[derive(Debug, Subcommand)]
pub enum EntitiesCommand {
    /// Import entities from a JSON array file.
    Import(EntitiesImportArgs),
    /// List catalog entities.
    List(EntitiesListArgs),
}

#[derive(Debug, Args)]
pub struct EntitiesImportArgs {
    pub path: PathBuf,
}

#[derive(Debug, Args)]
pub struct EntitiesListArgs {
    #[arg(long)]
    pub entity_type: Option<String>,

    #[arg(long = "exchange", num_args = 1..)]
    pub exchanges: Vec<String>,
}

#[derive(Debug, Args)]
pub struct SchemasArgs {
    #[command(subcommand)]
    pub command: SchemasCommand,
}

#[derive(Debug, Subcommand)]
pub enum SchemasCommand {
    /// List schema ids with their cadence.
    List,
    /// Show one schema's fields.
    Get(SchemaGetArgs),
}

#[derive(Debug, Args)]
pub struct SchemaGetArgs {
    pub id: String,
}

#[derive(Debug, Args)]
pub struct SqlArgs {
    pub query: String,

    #[arg(long, default_value_t = false)]
    pub write: bool,

    #[arg(long, default_value_t = 10_000)]
    pub max_rows: usize,

    #[arg(long, default_value_t = 5_000)]
    pub query_timeout_ms: u64,
}
