//! Views over the sync log.

use ::duckdb::Connection;

/// Create the progress views:
/// - `vw_sync_progress`: batches, records and newest timestamp per schema and entity
/// - `vw_sync_runs`: per-run totals
pub fn create_views(connection: &Connection) -> Result<(), ::duckdb::Error> {
    connection.execute_batch(
        r"
CREATE OR REPLACE VIEW vw_sync_progress AS
SELECT
    schema_id,
    entity_id,
    COUNT(*) AS batches,
    SUM(record_count)::BIGINT AS records,
    MIN(first_ts) AS first_ts,
    MAX(last_ts) AS last_ts,
    MAX(logged_at) AS last_synced_at
FROM sync_log
GROUP BY schema_id, entity_id;

CREATE OR REPLACE VIEW vw_sync_runs AS
SELECT
    run_id,
    schema_id,
    COUNT(DISTINCT entity_id) AS entities,
    SUM(record_count)::BIGINT AS records,
    MIN(logged_at) AS started_at,
    MAX(logged_at) AS finished_at
FROM sync_log
GROUP BY run_id, schema_id;
",
    )?;

    Ok(())
}
