//! Transactional persistence of one entity's batch.

use serde::Serialize;
use tracing::{debug, info};

use crate::config::SyncConfig;
use crate::context::RunContext;
use crate::domain::{Entity, PersistedRecord, SessionRules, Timestamp};
use crate::schema::SchemaSpec;
use crate::store::{BatchLog, Store};
use crate::StoreError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PersistOutcome {
    pub written: usize,
    /// The last record was held back as a still-forming bar.
    pub trimmed: bool,
    pub first: Option<Timestamp>,
    pub last: Option<Timestamp>,
}

pub struct BatchPersister<'a> {
    store: &'a dyn Store,
    schema: &'a SchemaSpec,
    config: &'a SyncConfig,
}

impl<'a> BatchPersister<'a> {
    pub fn new(store: &'a dyn Store, schema: &'a SchemaSpec, config: &'a SyncConfig) -> Self {
        Self {
            store,
            schema,
            config,
        }
    }

    pub fn persist(
        &self,
        ctx: &RunContext,
        entity: &Entity,
        mut records: Vec<PersistedRecord>,
    ) -> Result<PersistOutcome, StoreError> {
        let trimmed = self.trim_unfinished(ctx, entity, &mut records);
        if records.is_empty() {
            return Ok(PersistOutcome {
                trimmed,
                ..PersistOutcome::default()
            });
        }

        let written = self.store.upsert(self.schema, &records)?;
        let first = records.first().and_then(|record| record.timestamp);
        let last = records.last().and_then(|record| record.timestamp);
        info!(
            entity_id = %entity.id,
            level = self.schema.level().map_or("-", |level| level.as_str()),
            count = written,
            first = first.map(|ts| ts.to_string()).unwrap_or_default(),
            last = last.map(|ts| ts.to_string()).unwrap_or_default(),
            "persisted batch"
        );

        self.store.log_batch(&BatchLog {
            run_id: ctx.run_id().to_string(),
            schema_id: self.schema.id.clone(),
            entity_id: entity.id.clone(),
            record_count: written,
            first,
            last,
        })?;

        Ok(PersistOutcome {
            written,
            trimmed,
            first,
            last,
        })
    }

    /// Drops a last record stamped today while the session has not settled.
    fn trim_unfinished(
        &self,
        ctx: &RunContext,
        entity: &Entity,
        records: &mut Vec<PersistedRecord>,
    ) -> bool {
        if !self.config.trim_unfinished_period || self.schema.level().is_none() {
            return false;
        }
        let Some(last) = records.last().and_then(|record| record.timestamp) else {
            return false;
        };

        let rules = SessionRules::for_entity(entity);
        let now = rules.wall_clock(ctx.now());
        if last.date() != now.date() {
            return false;
        }

        let grace = time::Duration::try_from(self.config.unfinished_grace).unwrap_or(time::Duration::ZERO);
        if rules.has_settled(now, grace) {
            return false;
        }

        debug!(entity_id = %entity.id, last = %last, "holding back unfinished bar");
        records.pop();
        true
    }
}
