use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tickfill_core::{
    BackfillHook, Cadence, DuplicatePolicy, Entity, EntityQuery, EntityType,
    ExternalBackfillHook, FailureScope, FieldMap, HttpJsonAdapter, ReqwestHttpClient, RunContext,
    Runner, SchemaRegistry, SourceAdapter, SourcePolicy, StaticAdapter, StaticTimestamps,
    SyncConfig, SyncEngine, SyncReport, Timestamp, WarehouseStore,
};
use tickfill_warehouse::Warehouse;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::cli::{BackfillField, SyncArgs};
use crate::error::CliError;

use super::CommandResult;

pub async fn run(args: &SyncArgs, warehouse: &Arc<Warehouse>) -> Result<CommandResult, CliError> {
    let registry = SchemaRegistry::builtin();
    let schema = registry
        .get(args.schema.trim())
        .cloned()
        .ok_or_else(|| CliError::Command(format!("unknown schema '{}'", args.schema.trim())))?;

    let config = sync_config(args)?;
    let store = Arc::new(WarehouseStore::new(Arc::clone(warehouse)));
    let query = entity_query(args, &store)?;

    let mut engine = SyncEngine::new(store.clone(), adapter(args)?, schema.clone()).with_config(config);
    if let Some(path) = &args.field_map {
        let raw = std::fs::read_to_string(path)?;
        engine = engine.with_field_map(serde_json::from_str::<FieldMap>(&raw)?);
    }
    if let Some(path) = &args.timestamps {
        engine = engine.with_timestamp_source(Arc::new(timestamp_source(path)?));
    } else if schema.cadence == Cadence::Announcement {
        return Err(CliError::Command(format!(
            "schema '{}' needs --timestamps to know when records are published",
            schema.id
        )));
    }
    for field in &args.backfills {
        engine = match field {
            BackfillField::ChangePct => engine.with_hook(Arc::new(BackfillHook::change_pct())),
            BackfillField::CumulativeNetValue => engine.with_hook(Arc::new(
                ExternalBackfillHook::cumulative_net_value(net_value_source(args)?),
            )),
        };
    }

    let cancel = CancellationToken::new();
    let ctx = RunContext::system().with_cancel(cancel.clone());
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current step");
            cancel.cancel();
        }
    });

    match args.every {
        Some(every) => {
            let summary = Runner::new(Arc::new(engine), store, query)
                .with_interval(Duration::from_secs(every))
                .with_max_runs(args.max_runs)
                .run(&ctx)
                .await?;
            let mut result = CommandResult::ok(json!({
                "runs": summary.runs,
                "failed_runs": summary.failed_runs,
                "persisted": summary.persisted,
                "last": summary.last,
            }));
            if summary.failed_runs > 0 {
                result = result.with_warning(format!("{} run(s) failed", summary.failed_runs));
            }
            Ok(result)
        }
        None => {
            let report = engine.run_catalog(&ctx, store.as_ref(), &query).await?;
            let warnings = report_warnings(&report);
            let mut result = CommandResult::ok(serde_json::to_value(&report)?);
            for warning in warnings {
                result = result.with_warning(warning);
            }
            Ok(result)
        }
    }
}

fn sync_config(args: &SyncArgs) -> Result<SyncConfig, CliError> {
    let mut config = match &args.config {
        Some(path) => SyncConfig::from_json_file(path)?,
        None => SyncConfig::default(),
    };
    if let Some(batch_size) = args.batch_size {
        config = config.with_batch_size(batch_size);
    }
    if let Some(default_size) = args.default_size {
        config = config.with_default_size(default_size);
    }
    if let Some(pacing) = args.pacing_secs {
        config = config.with_pacing(seconds(pacing, "--pacing-secs")?);
    }
    if let Some(timeout) = args.timeout_secs {
        config = config.with_adapter_timeout(seconds(timeout, "--timeout-secs")?);
    }
    if args.max_cycles.is_some() {
        config = config.with_max_cycles(args.max_cycles);
    }
    if let Some(policy) = &args.duplicate_policy {
        config = config.with_duplicate_policy(DuplicatePolicy::from_str(policy)?);
    }
    if let Some(scope) = &args.failure_scope {
        config = config.with_failure_scope(FailureScope::from_str(scope)?);
    }
    if args.one_shot {
        config = config.with_one_shot(true);
    }
    if args.force_update {
        config = config.with_force_update(true);
    }
    if args.trim_unfinished {
        config = config.with_trim_unfinished_period(true);
    }
    config.validate()?;
    Ok(config)
}

fn seconds(value: f64, flag: &str) -> Result<Duration, CliError> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| CliError::Command(format!("{flag} must be a non-negative number of seconds")))
}

/// Explicit `--entity` ids are added to the catalog and selected by id;
/// otherwise the catalog filters apply.
fn entity_query(args: &SyncArgs, store: &WarehouseStore) -> Result<EntityQuery, CliError> {
    if !args.entities.is_empty() {
        let entities = args
            .entities
            .iter()
            .map(|id| Entity::parse_id(id))
            .collect::<Result<Vec<_>, _>>()?;
        store.import_entities(&entities)?;
        return Ok(EntityQuery {
            ids: entities.into_iter().map(|entity| entity.id).collect(),
            ..EntityQuery::default()
        });
    }

    Ok(EntityQuery {
        entity_type: args
            .entity_type
            .as_deref()
            .map(EntityType::from_str)
            .transpose()?,
        exchanges: args.exchanges.iter().map(|e| e.trim().to_ascii_lowercase()).collect(),
        codes: args.codes.iter().map(|c| c.trim().to_ascii_lowercase()).collect(),
        ..EntityQuery::default()
    })
}

fn adapter(args: &SyncArgs) -> Result<Arc<dyn SourceAdapter>, CliError> {
    if let Some(path) = &args.fixture {
        return Ok(Arc::new(StaticAdapter::from_json_file(path)?));
    }
    let Some(url) = &args.url else {
        return Err(CliError::Command(String::from(
            "a source is required: pass --fixture <file> or --url <template>",
        )));
    };

    let policy = SourcePolicy::new("http")
        .with_quota(args.quota_limit, Duration::from_secs(args.quota_window_secs));
    let mut adapter = HttpJsonAdapter::new(url.clone(), Arc::new(ReqwestHttpClient::new()), policy);
    if let Some(field) = &args.array_field {
        adapter = adapter.with_array_field(field.clone());
    }
    for rename in &args.renames {
        let (from, to) = pair(rename, "--rename")?;
        adapter = adapter.rename(from, to);
    }
    for header in &args.headers {
        let (name, value) = pair(header, "--header")?;
        adapter = adapter.with_header(name, value);
    }
    Ok(Arc::new(adapter))
}

fn net_value_source(args: &SyncArgs) -> Result<Arc<dyn SourceAdapter>, CliError> {
    if let Some(path) = &args.net_values {
        return Ok(Arc::new(StaticAdapter::from_json_file(path)?));
    }
    let Some(url) = &args.net_value_url else {
        return Err(CliError::Command(String::from(
            "--backfill cumulative-net-value needs --net-values <file> or --net-value-url <template>",
        )));
    };

    let policy = SourcePolicy::new("net-value")
        .with_quota(args.quota_limit, Duration::from_secs(args.quota_window_secs));
    let mut adapter = HttpJsonAdapter::new(url.clone(), Arc::new(ReqwestHttpClient::new()), policy);
    if let Some(field) = &args.net_value_array_field {
        adapter = adapter.with_array_field(field.clone());
    }
    for rename in &args.net_value_renames {
        let (from, to) = pair(rename, "--net-value-rename")?;
        adapter = adapter.rename(from, to);
    }
    Ok(Arc::new(adapter))
}

fn pair<'a>(value: &'a str, flag: &str) -> Result<(&'a str, &'a str), CliError> {
    value
        .split_once('=')
        .map(|(left, right)| (left.trim(), right.trim()))
        .filter(|(left, _)| !left.is_empty())
        .ok_or_else(|| CliError::Command(format!("{flag} expects key=value, got '{value}'")))
}

fn timestamp_source(path: &Path) -> Result<StaticTimestamps, CliError> {
    let raw = std::fs::read_to_string(path)?;
    let by_entity: HashMap<String, Vec<Timestamp>> = serde_json::from_str(&raw)?;
    Ok(by_entity
        .into_iter()
        .fold(StaticTimestamps::new(), |source, (entity_id, timestamps)| {
            source.with(entity_id, timestamps)
        }))
}

fn report_warnings(report: &SyncReport) -> Vec<String> {
    let mut warnings = Vec::new();
    if report.cancelled {
        warnings.push(String::from("run cancelled before every entity finished"));
    }
    if !report.unfinished.is_empty() {
        warnings.push(format!("{} entities unfinished", report.unfinished.len()));
    }
    if report.mapping_errors > 0 {
        warnings.push(format!("{} records skipped by mapping errors", report.mapping_errors));
    }
    if report.adapter_errors + report.store_errors > 0 {
        warnings.push(format!(
            "{} adapter and {} store errors were retried",
            report.adapter_errors, report.store_errors
        ));
    }
    warnings
}
