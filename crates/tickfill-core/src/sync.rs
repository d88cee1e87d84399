//! The sync loop: drives every entity of a run to convergence.
//!
//! Each cycle walks the still-unfinished entities in order. For each one the
//! loop resolves a cursor from the latest stored record, fetches through the
//! adapter, normalizes, resolves duplicate ids and persists the batch. An
//! entity finishes when its cursor needs nothing, the source is exhausted,
//! the fetch yields nothing new, or the run is one-shot.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn, Instrument};

use crate::adapter::{AdapterError, FetchBatch, SourceAdapter};
use crate::config::{FailureScope, SyncConfig};
use crate::context::RunContext;
use crate::cursor::{Cursor, CursorResolver, ResolveError, TimestampSource};
use crate::dedup::DuplicateResolver;
use crate::domain::Entity;
use crate::field_map::FieldMap;
use crate::hooks::{FinishHook, HookError};
use crate::normalize::Normalizer;
use crate::persist::BatchPersister;
use crate::schema::{Cadence, SchemaSpec};
use crate::store::{EntityCatalog, EntityQuery, Store};
use crate::{NormalizeError, StoreError, SyncError};

/// Outcome of one sync run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub run_id: String,
    pub schema: String,
    pub cycles: usize,
    pub finished: Vec<String>,
    pub unfinished: Vec<String>,
    pub persisted: usize,
    pub skipped: usize,
    pub mapping_errors: usize,
    pub adapter_errors: usize,
    pub store_errors: usize,
    pub cancelled: bool,
}

impl SyncReport {
    fn new(ctx: &RunContext, schema: &SchemaSpec) -> Self {
        Self {
            run_id: ctx.run_id().to_string(),
            schema: schema.id.clone(),
            ..Self::default()
        }
    }

    /// Every entity finished and the run was not cancelled.
    pub fn is_complete(&self) -> bool {
        self.unfinished.is_empty() && !self.cancelled
    }
}

enum Step {
    Finished,
    Pending,
}

enum StepError {
    Adapter(AdapterError),
    Store(StoreError),
    Cancelled,
    Fatal(SyncError),
}

impl From<AdapterError> for StepError {
    fn from(error: AdapterError) -> Self {
        Self::Adapter(error)
    }
}

impl From<StoreError> for StepError {
    fn from(error: StoreError) -> Self {
        Self::Store(error)
    }
}

impl From<SyncError> for StepError {
    fn from(error: SyncError) -> Self {
        match error {
            SyncError::Cancelled => Self::Cancelled,
            other => Self::Fatal(other),
        }
    }
}

impl From<ResolveError> for StepError {
    fn from(error: ResolveError) -> Self {
        match error {
            ResolveError::Adapter(error) => Self::Adapter(error),
            ResolveError::Sync(error) => error.into(),
        }
    }
}

/// Syncs one schema from one adapter into one store.
pub struct SyncEngine {
    store: Arc<dyn Store>,
    adapter: Arc<dyn SourceAdapter>,
    schema: SchemaSpec,
    config: SyncConfig,
    field_map: FieldMap,
    timestamps: Option<Arc<dyn TimestampSource>>,
    hooks: Vec<Arc<dyn FinishHook>>,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn Store>, adapter: Arc<dyn SourceAdapter>, schema: SchemaSpec) -> Self {
        Self {
            store,
            adapter,
            schema,
            config: SyncConfig::default(),
            field_map: FieldMap::default(),
            timestamps: None,
            hooks: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_field_map(mut self, field_map: FieldMap) -> Self {
        self.field_map = field_map;
        self
    }

    #[must_use]
    pub fn with_timestamp_source(mut self, source: Arc<dyn TimestampSource>) -> Self {
        self.timestamps = Some(source);
        self
    }

    #[must_use]
    pub fn with_hook(mut self, hook: Arc<dyn FinishHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn schema(&self) -> &SchemaSpec {
        &self.schema
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Sync the entities matching `query` in `catalog`.
    pub async fn run_catalog(
        &self,
        ctx: &RunContext,
        catalog: &dyn EntityCatalog,
        query: &EntityQuery,
    ) -> Result<SyncReport, SyncError> {
        let entities = catalog.list(query).map_err(SyncError::Catalog)?;
        self.run(ctx, entities).await
    }

    /// Sync `entities` until each one finishes, the run is cancelled, or
    /// `max_cycles` is reached. Adapter and store failures never end the
    /// run; they are counted in the report.
    pub async fn run(&self, ctx: &RunContext, entities: Vec<Entity>) -> Result<SyncReport, SyncError> {
        self.config.validate()?;
        if self.schema.cadence == Cadence::Announcement && self.timestamps.is_none() {
            return Err(SyncError::MissingTimestampSource(self.schema.id.clone()));
        }

        let span = ctx.span().clone();
        span.record("schema", self.schema.id.as_str());

        async {
            let result = match self.store.prepare(&self.schema) {
                Ok(()) => self.run_cycles(ctx, entities).await,
                Err(source) => Err(SyncError::StorePrepare {
                    schema: self.schema.id.clone(),
                    source,
                }),
            };
            self.store.close();
            result
        }
        .instrument(span)
        .await
    }

    async fn run_cycles(&self, ctx: &RunContext, entities: Vec<Entity>) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::new(ctx, &self.schema);
        let mut seen = HashSet::new();
        let mut unfinished = entities
            .into_iter()
            .filter(|entity| seen.insert(entity.id.clone()))
            .collect::<Vec<_>>();
        info!(entities = unfinished.len(), adapter = self.adapter.name(), "sync run started");

        let mut resolver = CursorResolver::new(&self.schema, &self.config, self.timestamps.clone());

        loop {
            if ctx.is_cancelled() {
                report.cancelled = true;
                break;
            }
            report.cycles += 1;

            let mut finished = HashSet::new();
            let mut cycle_failed = false;
            for (index, entity) in unfinished.iter().enumerate() {
                if ctx.is_cancelled() {
                    report.cancelled = true;
                    break;
                }

                match self.sync_entity(ctx, &mut resolver, entity, &mut report).await {
                    Ok(Step::Finished) => {
                        finished.insert(entity.id.clone());
                    }
                    Ok(Step::Pending) => {}
                    Err(StepError::Cancelled) => {
                        report.cancelled = true;
                        break;
                    }
                    Err(StepError::Fatal(error)) => return Err(error),
                    Err(failure) => {
                        match failure {
                            StepError::Adapter(error) => {
                                report.adapter_errors += 1;
                                warn!(entity_id = %entity.id, code = error.code(), error = %error, "adapter call failed");
                            }
                            StepError::Store(error) => {
                                report.store_errors += 1;
                                warn!(entity_id = %entity.id, error = %error, "store call failed");
                            }
                            StepError::Cancelled | StepError::Fatal(_) => {}
                        }
                        cycle_failed = true;
                        if self.config.failure_scope == FailureScope::RetryAll {
                            finished.clear();
                            break;
                        }
                    }
                }

                if (index + 1) % self.config.batch_size == 0 {
                    info!(
                        cycle = report.cycles,
                        handled = index + 1,
                        of = unfinished.len(),
                        "cycle progress"
                    );
                }
            }

            let (done, pending): (Vec<_>, Vec<_>) = unfinished
                .into_iter()
                .partition(|entity| finished.contains(&entity.id));
            unfinished = pending;
            for entity in &done {
                self.run_hooks(entity, &mut report).await;
                report.finished.push(entity.id.clone());
            }

            if report.cancelled || unfinished.is_empty() {
                break;
            }
            if self.config.max_cycles.is_some_and(|max| report.cycles >= max) {
                warn!(cycles = report.cycles, unfinished = unfinished.len(), "cycle limit reached");
                break;
            }
            if cycle_failed && ctx.sleep(self.config.pacing).await.is_err() {
                report.cancelled = true;
                break;
            }
        }

        report.unfinished = unfinished.into_iter().map(|entity| entity.id).collect();
        info!(
            cycles = report.cycles,
            finished = report.finished.len(),
            unfinished = report.unfinished.len(),
            persisted = report.persisted,
            cancelled = report.cancelled,
            "sync run ended"
        );
        Ok(report)
    }

    async fn sync_entity(
        &self,
        ctx: &RunContext,
        resolver: &mut CursorResolver<'_>,
        entity: &Entity,
        report: &mut SyncReport,
    ) -> Result<Step, StepError> {
        let latest = self.store.latest(&self.schema, &entity.id, self.schema.level())?;
        let cursor = resolver.resolve(ctx, entity, latest.as_ref()).await?;
        if cursor.is_done() {
            debug!(entity_id = %entity.id, "nothing to fetch");
            return Ok(Step::Finished);
        }

        let batch = self.fetch(ctx, entity, &cursor).await?;
        let fetched = batch.records.len();

        let normalizer = Normalizer::new(self.store.as_ref(), &self.schema, &self.field_map);
        let mut normalized = Vec::with_capacity(fetched);
        for raw in &batch.records {
            match normalizer.normalize(entity, raw, self.config.force_update) {
                Ok(Some(record)) => normalized.push(record),
                Ok(None) => report.skipped += 1,
                Err(NormalizeError::Mapping(error)) => {
                    report.mapping_errors += 1;
                    warn!(entity_id = %entity.id, error = %error, "skipping unmappable record");
                }
                Err(NormalizeError::Store(error)) => return Err(error.into()),
            }
        }

        let deduped = DuplicateResolver::new(self.config.duplicate_policy).resolve(normalized);
        let outcome = BatchPersister::new(self.store.as_ref(), &self.schema, &self.config)
            .persist(ctx, entity, deduped)?;
        report.persisted += outcome.written;

        if batch.is_empty() || batch.exhausted || self.config.one_shot || outcome.written == 0 {
            info!(
                entity_id = %entity.id,
                fetched,
                written = outcome.written,
                latest = outcome.last.map(|ts| ts.to_string()).unwrap_or_default(),
                "entity finished"
            );
            return Ok(Step::Finished);
        }

        ctx.sleep(self.config.pacing).await?;
        Ok(Step::Pending)
    }

    async fn fetch(&self, ctx: &RunContext, entity: &Entity, cursor: &Cursor) -> Result<FetchBatch, StepError> {
        let timeout = self.config.adapter_timeout;
        match ctx.timeout(timeout, self.adapter.fetch(entity, cursor)).await? {
            Some(batch) => Ok(batch?),
            None => Err(AdapterError::timeout(timeout).into()),
        }
    }

    async fn run_hooks(&self, entity: &Entity, report: &mut SyncReport) {
        for hook in &self.hooks {
            let Err(error) = hook.on_finish(self.store.as_ref(), &self.schema, entity).await else {
                continue;
            };
            match error {
                HookError::Store(_) => report.store_errors += 1,
                HookError::Adapter(_) => report.adapter_errors += 1,
            }
            warn!(hook = hook.name(), entity_id = %entity.id, error = %error, "finish hook failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::StaticAdapter;
    use crate::clock::ManualClock;
    use crate::domain::{EntityType, IntervalLevel, RawRecord};
    use crate::schema::kdata_schema;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::time::Duration;
    use time::macros::datetime;

    fn bar(day: &str, close: f64) -> RawRecord {
        let mut record = RawRecord::new();
        record.insert(String::from("timestamp"), json!(day));
        record.insert(String::from("close"), json!(close));
        record
    }

    fn context() -> (Arc<ManualClock>, RunContext) {
        let clock = Arc::new(ManualClock::new(datetime!(2020-01-05 12:00 UTC)));
        let ctx = RunContext::new(clock.clone());
        (clock, ctx)
    }

    fn entity() -> Entity {
        Entity::parse_id("stock_sz_000338").expect("entity")
    }

    #[tokio::test]
    async fn persists_then_finishes_when_exhausted() {
        let store = Arc::new(MemoryStore::new());
        let adapter = Arc::new(
            StaticAdapter::new().with_records("stock_sz_000338", vec![bar("2020-01-02", 1.0), bar("2020-01-03", 2.0)]),
        );
        let engine = SyncEngine::new(store.clone(), adapter, kdata_schema(EntityType::Stock, IntervalLevel::OneDay));
        let (_, ctx) = context();

        let report = engine.run(&ctx, vec![entity()]).await.expect("report");
        assert!(report.is_complete());
        assert_eq!(report.persisted, 2);
        assert_eq!(report.cycles, 1);
    }

    #[tokio::test]
    async fn cancellation_before_start_reports_everything_unfinished() {
        let store = Arc::new(MemoryStore::new());
        let adapter = Arc::new(StaticAdapter::new());
        let engine = SyncEngine::new(store, adapter, kdata_schema(EntityType::Stock, IntervalLevel::OneDay));
        let (_, ctx) = context();
        ctx.cancel();

        let report = engine.run(&ctx, vec![entity()]).await.expect("report");
        assert!(report.cancelled);
        assert_eq!(report.unfinished, vec![String::from("stock_sz_000338")]);
        assert_eq!(report.cycles, 0);
    }

    #[tokio::test]
    async fn failed_cycle_backs_off_by_pacing() {
        let store = Arc::new(MemoryStore::new());
        let adapter = Arc::new(StaticAdapter::new().with_records("stock_sz_000338", vec![bar("2020-01-02", 1.0)]));
        adapter.fail_next(AdapterError::unavailable("503"));
        let engine = SyncEngine::new(store, adapter.clone(), kdata_schema(EntityType::Stock, IntervalLevel::OneDay))
            .with_config(SyncConfig::default().with_pacing(Duration::from_secs(7)));
        let (clock, ctx) = context();

        let report = engine.run(&ctx, vec![entity()]).await.expect("report");
        assert!(report.is_complete());
        assert_eq!(report.adapter_errors, 1);
        assert_eq!(report.cycles, 2);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(7)]);
        assert_eq!(adapter.fetch_count(), 2);
    }

    #[tokio::test]
    async fn announcement_schema_without_source_is_rejected() {
        let registry = crate::schema::SchemaRegistry::builtin();
        let schema = registry.get("finance_report").expect("schema").clone();
        let engine = SyncEngine::new(Arc::new(MemoryStore::new()), Arc::new(StaticAdapter::new()), schema);
        let (_, ctx) = context();

        let error = engine.run(&ctx, vec![entity()]).await.expect_err("missing source");
        assert!(matches!(error, SyncError::MissingTimestampSource(_)));
    }
}
