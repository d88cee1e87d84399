//! DuckDB storage for synchronized records.
//!
//! The warehouse keeps one table per record schema plus an `entities` catalog
//! and a `sync_log` of committed batches. Record tables are declared at run
//! time through [`Warehouse::register_table`]; every value is bound as a
//! statement parameter and table or column names are restricted to plain
//! identifiers.

pub mod duckdb;
mod error;
pub mod migrations;
mod models;
mod query;
pub mod views;

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use ::duckdb::types::Value as DuckValue;
use ::duckdb::{params, params_from_iter, Connection, ToSql};

pub use duckdb::{AccessMode, DuckDbConnectionManager, PooledConnection};
pub use error::WarehouseError;
pub use models::{
    Cell, ColumnDef, ColumnType, EntityFilter, EntityRow, RecordRow, SyncLogEntry, TableDef,
};
pub use query::{QueryGuardrails, QueryResult, SqlColumn};

use models::KEY_COLUMNS;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S.%f";

#[derive(Debug, Clone)]
pub struct WarehouseConfig {
    pub tickfill_home: PathBuf,
    pub db_path: PathBuf,
    pub max_pool_size: usize,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self::under(resolve_tickfill_home())
    }
}

impl WarehouseConfig {
    /// Configuration rooted at `tickfill_home` with the default database path.
    #[must_use]
    pub fn under(tickfill_home: impl Into<PathBuf>) -> Self {
        let tickfill_home = tickfill_home.into();
        let db_path = tickfill_home.join("warehouse.duckdb");
        Self {
            tickfill_home,
            db_path,
            max_pool_size: 4,
        }
    }
}

#[derive(Clone)]
pub struct Warehouse {
    manager: DuckDbConnectionManager,
    tables: Arc<Mutex<HashMap<String, TableDef>>>,
}

impl Warehouse {
    pub fn open_default() -> Result<Self, WarehouseError> {
        Self::open(WarehouseConfig::default())
    }

    pub fn open(config: WarehouseConfig) -> Result<Self, WarehouseError> {
        if let Some(parent) = config.db_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let manager = DuckDbConnectionManager::new(config.db_path, config.max_pool_size);
        let warehouse = Self {
            manager,
            tables: Arc::new(Mutex::new(HashMap::new())),
        };
        warehouse.initialize()?;
        Ok(warehouse)
    }

    pub fn initialize(&self) -> Result<(), WarehouseError> {
        let connection = self.manager.acquire(AccessMode::ReadWrite)?;
        migrations::apply_migrations(&connection)?;
        views::create_views(&connection)?;
        Ok(())
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        self.manager.db_path()
    }

    /// Create the table for `table` if needed and add any columns it is missing.
    pub fn register_table(&self, table: &TableDef) -> Result<(), WarehouseError> {
        table.validate()?;

        let mut ddl = format!(
            "CREATE TABLE IF NOT EXISTS {name} (\n    id TEXT PRIMARY KEY,\n    entity_id TEXT NOT NULL,\n    code TEXT NOT NULL,\n    timestamp TIMESTAMP,\n    level TEXT",
            name = table.name
        );
        for column in &table.columns {
            ddl.push_str(format!(",\n    {} {}", column.name, column.column_type.sql_type()).as_str());
        }
        ddl.push_str(",\n    updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP\n);\n");
        for column in &table.columns {
            ddl.push_str(
                format!(
                    "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {};\n",
                    table.name,
                    column.name,
                    column.column_type.sql_type()
                )
                .as_str(),
            );
        }

        let connection = self.manager.acquire(AccessMode::ReadWrite)?;
        connection.execute_batch(ddl.as_str())?;
        self.tables
            .lock()
            .expect("warehouse table registry mutex poisoned")
            .insert(table.name.clone(), table.clone());
        Ok(())
    }

    /// Newest row of `entity_id` by timestamp; rows without a timestamp sort last.
    pub fn latest_row(
        &self,
        table: &str,
        entity_id: &str,
        level: Option<&str>,
    ) -> Result<Option<RecordRow>, WarehouseError> {
        let def = self.table(table)?;
        let mut sql = format!(
            "SELECT {} FROM {} WHERE entity_id = ?",
            select_list(&def),
            def.name
        );
        let mut params: Vec<Box<dyn ToSql>> = vec![Box::new(entity_id.to_string())];
        if let Some(level) = level {
            sql.push_str(" AND level = ?");
            params.push(Box::new(level.to_string()));
        }
        sql.push_str(" ORDER BY timestamp DESC NULLS LAST LIMIT 1");

        let mut rows = self.select_rows(&def, sql.as_str(), &params)?;
        Ok(rows.pop())
    }

    pub fn find_row(
        &self,
        table: &str,
        entity_id: &str,
        id: &str,
    ) -> Result<Option<RecordRow>, WarehouseError> {
        let def = self.table(table)?;
        let sql = format!(
            "SELECT {} FROM {} WHERE entity_id = ? AND id = ?",
            select_list(&def),
            def.name
        );
        let params: Vec<Box<dyn ToSql>> =
            vec![Box::new(entity_id.to_string()), Box::new(id.to_string())];
        let mut rows = self.select_rows(&def, sql.as_str(), &params)?;
        Ok(rows.pop())
    }

    pub fn row_exists(&self, table: &str, id: &str) -> Result<bool, WarehouseError> {
        let def = self.table(table)?;
        let sql = format!("SELECT COUNT(*) FROM {} WHERE id = ?", def.name);
        let connection = self.manager.acquire(AccessMode::ReadWrite)?;
        let count: i64 = connection.query_row(sql.as_str(), params![id], |row| row.get(0))?;
        Ok(count > 0)
    }

    /// Rows of `entity_id` in ascending timestamp order.
    pub fn entity_rows(&self, table: &str, entity_id: &str) -> Result<Vec<RecordRow>, WarehouseError> {
        let def = self.table(table)?;
        let sql = format!(
            "SELECT {} FROM {} WHERE entity_id = ? ORDER BY timestamp ASC NULLS LAST, id ASC",
            select_list(&def),
            def.name
        );
        let params: Vec<Box<dyn ToSql>> = vec![Box::new(entity_id.to_string())];
        self.select_rows(&def, sql.as_str(), &params)
    }

    /// Rows of `entity_id` whose `column` is null, in ascending timestamp order.
    pub fn rows_missing(
        &self,
        table: &str,
        entity_id: &str,
        column: &str,
    ) -> Result<Vec<RecordRow>, WarehouseError> {
        let def = self.table(table)?;
        if def.column(column).is_none() {
            return Err(WarehouseError::QueryRejected(format!(
                "table '{}' has no column '{column}'",
                def.name
            )));
        }

        let sql = format!(
            "SELECT {} FROM {} WHERE entity_id = ? AND {column} IS NULL ORDER BY timestamp ASC NULLS LAST, id ASC",
            select_list(&def),
            def.name
        );
        let params: Vec<Box<dyn ToSql>> = vec![Box::new(entity_id.to_string())];
        self.select_rows(&def, sql.as_str(), &params)
    }

    /// Insert or replace `rows` in one transaction. Either every row is
    /// written or none is.
    pub fn upsert_rows(&self, table: &str, rows: &[RecordRow]) -> Result<usize, WarehouseError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let def = self.table(table)?;
        for row in rows {
            if let Some((name, _)) = row.cells.iter().find(|(name, _)| def.column(name).is_none()) {
                return Err(WarehouseError::QueryRejected(format!(
                    "table '{}' has no column '{name}'",
                    def.name
                )));
            }
        }

        let mut column_names = KEY_COLUMNS.iter().map(ToString::to_string).collect::<Vec<_>>();
        let mut placeholders = vec!["?", "?", "?", "TRY_CAST(? AS TIMESTAMP)", "?"];
        for column in &def.columns {
            column_names.push(column.name.clone());
            placeholders.push(match column.column_type {
                ColumnType::Timestamp => "TRY_CAST(? AS TIMESTAMP)",
                _ => "?",
            });
        }
        column_names.push(String::from("updated_at"));
        placeholders.push("CURRENT_TIMESTAMP");
        let sql = format!(
            "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
            def.name,
            column_names.join(", "),
            placeholders.join(", ")
        );

        let connection = self.manager.acquire(AccessMode::ReadWrite)?;
        connection.execute_batch("BEGIN TRANSACTION")?;
        let result = (|| -> Result<usize, WarehouseError> {
            let mut statement = connection.prepare(sql.as_str())?;
            for row in rows {
                let mut values = vec![
                    Cell::Text(row.id.clone()),
                    Cell::Text(row.entity_id.clone()),
                    Cell::Text(row.code.clone()),
                    row.timestamp.clone().map_or(Cell::Null, Cell::Timestamp),
                    row.level.clone().map_or(Cell::Null, Cell::Text),
                ];
                for column in &def.columns {
                    values.push(row.cell(column.name.as_str()).cloned().unwrap_or(Cell::Null));
                }
                statement.execute(params_from_iter(values.iter()))?;
            }
            Ok(rows.len())
        })();

        finalize_transaction(&connection, result)
    }

    pub fn upsert_entities(&self, entities: &[EntityRow]) -> Result<usize, WarehouseError> {
        if entities.is_empty() {
            return Ok(0);
        }

        let connection = self.manager.acquire(AccessMode::ReadWrite)?;
        connection.execute_batch("BEGIN TRANSACTION")?;
        let result = (|| -> Result<usize, WarehouseError> {
            let mut statement = connection.prepare(
                r#"
INSERT OR REPLACE INTO entities (
    id, entity_type, exchange, code, name, inception, updated_at
) VALUES (?, ?, ?, ?, ?, TRY_CAST(? AS TIMESTAMP), CURRENT_TIMESTAMP)
"#,
            )?;
            for entity in entities {
                statement.execute(params![
                    entity.id,
                    entity.entity_type,
                    entity.exchange,
                    entity.code,
                    entity.name,
                    entity.inception,
                ])?;
            }
            Ok(entities.len())
        })();

        finalize_transaction(&connection, result)
    }

    pub fn list_entities(&self, filter: &EntityFilter) -> Result<Vec<EntityRow>, WarehouseError> {
        let mut sql = format!(
            "SELECT id, entity_type, exchange, code, name, strftime(inception, '{TIMESTAMP_FORMAT}') FROM entities WHERE 1 = 1"
        );
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();
        if let Some(entity_type) = &filter.entity_type {
            sql.push_str(" AND entity_type = ?");
            params.push(Box::new(entity_type.clone()));
        }
        push_in_clause(&mut sql, &mut params, "exchange", &filter.exchanges);
        push_in_clause(&mut sql, &mut params, "id", &filter.ids);
        push_in_clause(&mut sql, &mut params, "code", &filter.codes);
        sql.push_str(" ORDER BY id");

        let connection = self.manager.acquire(AccessMode::ReadWrite)?;
        let mut statement = connection.prepare(sql.as_str())?;
        let mut cursor = statement.query(params_from_iter(params.iter()))?;
        let mut entities = Vec::new();
        while let Some(row) = cursor.next()? {
            entities.push(EntityRow {
                id: row.get(0)?,
                entity_type: row.get(1)?,
                exchange: row.get(2)?,
                code: row.get(3)?,
                name: row.get(4)?,
                inception: row.get(5)?,
            });
        }
        Ok(entities)
    }

    pub fn log_sync(&self, entry: &SyncLogEntry) -> Result<(), WarehouseError> {
        let connection = self.manager.acquire(AccessMode::ReadWrite)?;
        connection.execute(
            r#"
INSERT INTO sync_log (run_id, schema_id, entity_id, record_count, first_ts, last_ts, logged_at)
VALUES (?, ?, ?, ?, TRY_CAST(? AS TIMESTAMP), TRY_CAST(? AS TIMESTAMP), CURRENT_TIMESTAMP)
"#,
            params![
                entry.run_id,
                entry.schema_id,
                entry.entity_id,
                i64::try_from(entry.record_count).unwrap_or(i64::MAX),
                entry.first_ts,
                entry.last_ts,
            ],
        )?;
        Ok(())
    }

    pub fn execute_query(
        &self,
        sql: &str,
        guardrails: QueryGuardrails,
        allow_write: bool,
    ) -> Result<QueryResult, WarehouseError> {
        guardrails.validate()?;
        let sql = query::normalize_sql(sql)?;
        if !allow_write {
            query::enforce_read_only(sql)?;
        }

        let mode = if allow_write {
            AccessMode::ReadWrite
        } else {
            AccessMode::ReadOnly
        };
        let connection = self.manager.acquire(mode)?;
        query::execute_with_guardrails(&connection, sql, guardrails, allow_write)
    }

    /// Close idle connections. The warehouse reopens them on next use.
    pub fn release_idle(&self) {
        self.manager.release_idle();
    }

    fn table(&self, name: &str) -> Result<TableDef, WarehouseError> {
        self.tables
            .lock()
            .expect("warehouse table registry mutex poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| WarehouseError::UnknownTable(name.to_string()))
    }

    fn select_rows(
        &self,
        def: &TableDef,
        sql: &str,
        params: &[Box<dyn ToSql>],
    ) -> Result<Vec<RecordRow>, WarehouseError> {
        let connection = self.manager.acquire(AccessMode::ReadWrite)?;
        let mut statement = connection.prepare(sql)?;
        let mut cursor = statement.query(params_from_iter(params.iter()))?;
        let mut rows = Vec::new();
        while let Some(row) = cursor.next()? {
            let mut cells = Vec::with_capacity(def.columns.len());
            for (offset, column) in def.columns.iter().enumerate() {
                let value: DuckValue = row.get(KEY_COLUMNS.len() + offset)?;
                cells.push((column.name.clone(), Cell::from_duck(value, column.column_type)));
            }
            rows.push(RecordRow {
                id: row.get(0)?,
                entity_id: row.get(1)?,
                code: row.get(2)?,
                timestamp: row.get(3)?,
                level: row.get(4)?,
                cells,
            });
        }
        Ok(rows)
    }
}

fn select_list(def: &TableDef) -> String {
    let mut columns = vec![
        String::from("id"),
        String::from("entity_id"),
        String::from("code"),
        format!("strftime(timestamp, '{TIMESTAMP_FORMAT}')"),
        String::from("level"),
    ];
    for column in &def.columns {
        columns.push(match column.column_type {
            ColumnType::Timestamp => format!("strftime({}, '{TIMESTAMP_FORMAT}')", column.name),
            _ => column.name.clone(),
        });
    }
    columns.join(", ")
}

fn push_in_clause(
    sql: &mut String,
    params: &mut Vec<Box<dyn ToSql>>,
    column: &str,
    values: &[String],
) {
    if values.is_empty() {
        return;
    }
    let placeholders = vec!["?"; values.len()].join(", ");
    sql.push_str(format!(" AND {column} IN ({placeholders})").as_str());
    for value in values {
        params.push(Box::new(value.clone()));
    }
}

fn finalize_transaction<T>(
    connection: &Connection,
    result: Result<T, WarehouseError>,
) -> Result<T, WarehouseError> {
    match result {
        Ok(value) => {
            connection.execute_batch("COMMIT")?;
            Ok(value)
        }
        Err(error) => {
            let _ = connection.execute_batch("ROLLBACK");
            Err(error)
        }
    }
}

/// `TICKFILL_HOME`, else `$HOME/.tickfill`, else `.tickfill`.
#[must_use]
pub fn resolve_tickfill_home() -> PathBuf {
    if let Some(path) = env::var_os("TICKFILL_HOME") {
        let path = PathBuf::from(path);
        if !path.as_os_str().is_empty() {
            return path;
        }
    }

    if let Some(home) = env::var_os("HOME") {
        return PathBuf::from(home).join(".tickfill");
    }

    PathBuf::from(".tickfill")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_temp(temp: &tempfile::TempDir) -> Warehouse {
        let mut config = WarehouseConfig::under(temp.path().join("home"));
        config.max_pool_size = 2;
        Warehouse::open(config).expect("warehouse open")
    }

    fn bars_table() -> TableDef {
        TableDef::new(
            "stock_1d_kdata",
            vec![
                ColumnDef::new("close", ColumnType::Double),
                ColumnDef::new("volume", ColumnType::BigInt),
            ],
        )
    }

    fn bar(id: &str, timestamp: &str, close: f64) -> RecordRow {
        RecordRow {
            id: id.to_string(),
            entity_id: String::from("stock_sz_000338"),
            code: String::from("000338"),
            timestamp: Some(timestamp.to_string()),
            level: Some(String::from("1d")),
            cells: vec![(String::from("close"), Cell::Float(close))],
        }
    }

    #[test]
    fn initializes_catalog_and_views() {
        let temp = tempdir().expect("tempdir");
        let warehouse = open_temp(&temp);

        let query = warehouse
            .execute_query(
                "SELECT table_name FROM information_schema.tables WHERE table_name IN ('entities', 'sync_log', 'vw_sync_progress')",
                QueryGuardrails::default(),
                false,
            )
            .expect("query");
        assert_eq!(query.row_count, 3);
    }

    #[test]
    fn read_only_mode_rejects_write_query() {
        let temp = tempdir().expect("tempdir");
        let warehouse = open_temp(&temp);

        let error = warehouse
            .execute_query("DROP TABLE entities", QueryGuardrails::default(), false)
            .expect_err("should reject");
        assert!(matches!(error, WarehouseError::QueryRejected(_)));
    }

    #[test]
    fn unregistered_table_is_rejected() {
        let temp = tempdir().expect("tempdir");
        let warehouse = open_temp(&temp);

        let error = warehouse
            .latest_row("stock_1d_kdata", "stock_sz_000338", None)
            .expect_err("unknown table");
        assert!(matches!(error, WarehouseError::UnknownTable(_)));
    }

    #[test]
    fn latest_row_orders_by_timestamp_and_reads_missing_cells_as_null() {
        let temp = tempdir().expect("tempdir");
        let warehouse = open_temp(&temp);
        warehouse.register_table(&bars_table()).expect("register");

        warehouse
            .upsert_rows(
                "stock_1d_kdata",
                &[
                    bar("stock_sz_000338_2020-01-02", "2020-01-02 00:00:00", 11.0),
                    bar("stock_sz_000338_2020-01-01", "2020-01-01 00:00:00", 10.0),
                ],
            )
            .expect("upsert");

        let latest = warehouse
            .latest_row("stock_1d_kdata", "stock_sz_000338", Some("1d"))
            .expect("latest")
            .expect("row");
        assert_eq!(latest.id, "stock_sz_000338_2020-01-02");
        assert_eq!(latest.timestamp.as_deref(), Some("2020-01-02 00:00:00.000000"));
        assert_eq!(latest.cell("close"), Some(&Cell::Float(11.0)));
        assert_eq!(latest.cell("volume"), Some(&Cell::Null));
    }

    #[test]
    fn entity_filter_matches_exchange_and_type() {
        let temp = tempdir().expect("tempdir");
        let warehouse = open_temp(&temp);
        warehouse
            .upsert_entities(&[
                EntityRow {
                    id: String::from("stock_sz_000338"),
                    entity_type: String::from("stock"),
                    exchange: String::from("sz"),
                    code: String::from("000338"),
                    name: None,
                    inception: Some(String::from("2007-04-30 00:00:00")),
                },
                EntityRow {
                    id: String::from("coin_binance_btc"),
                    entity_type: String::from("coin"),
                    exchange: String::from("binance"),
                    code: String::from("btc"),
                    name: Some(String::from("Bitcoin")),
                    inception: None,
                },
            ])
            .expect("entities");

        let stocks = warehouse
            .list_entities(&EntityFilter {
                entity_type: Some(String::from("stock")),
                exchanges: vec![String::from("sz"), String::from("sh")],
                ..EntityFilter::default()
            })
            .expect("list");
        assert_eq!(stocks.len(), 1);
        assert_eq!(
            stocks[0].inception.as_deref(),
            Some("2007-04-30 00:00:00.000000")
        );
    }
}
