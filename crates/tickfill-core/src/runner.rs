//! Repeats sync runs on a fixed interval until cancelled.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::context::RunContext;
use crate::store::{EntityCatalog, EntityQuery};
use crate::sync::{SyncEngine, SyncReport};
use crate::SyncError;

/// Totals over every run a [`Runner`] performed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunnerSummary {
    pub runs: usize,
    pub failed_runs: usize,
    pub persisted: usize,
    pub last: Option<SyncReport>,
}

/// Drives one engine against the catalog entities matching a query.
pub struct Runner {
    engine: Arc<SyncEngine>,
    catalog: Arc<dyn EntityCatalog>,
    query: EntityQuery,
    interval: Duration,
    retry_delay: Duration,
    max_runs: Option<usize>,
}

impl Runner {
    pub fn new(engine: Arc<SyncEngine>, catalog: Arc<dyn EntityCatalog>, query: EntityQuery) -> Self {
        Self {
            engine,
            catalog,
            query,
            interval: Duration::from_secs(60),
            retry_delay: Duration::from_secs(10),
            max_runs: None,
        }
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    #[must_use]
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    #[must_use]
    pub fn with_max_runs(mut self, max_runs: Option<usize>) -> Self {
        self.max_runs = max_runs;
        self
    }

    /// Run until `ctx` is cancelled or `max_runs` is reached. Each run gets a
    /// fresh run id. Failed runs wait `retry_delay` instead of the interval;
    /// configuration errors end the loop since retrying cannot fix them.
    pub async fn run(&self, ctx: &RunContext) -> Result<RunnerSummary, SyncError> {
        let mut summary = RunnerSummary::default();
        loop {
            if ctx.is_cancelled() {
                break;
            }
            let run_ctx = ctx.next_run();
            summary.runs += 1;

            let delay = match self
                .engine
                .run_catalog(&run_ctx, self.catalog.as_ref(), &self.query)
                .await
            {
                Ok(report) => {
                    info!(
                        run = summary.runs,
                        run_id = %report.run_id,
                        persisted = report.persisted,
                        unfinished = report.unfinished.len(),
                        "scheduled run finished"
                    );
                    summary.persisted += report.persisted;
                    let cancelled = report.cancelled;
                    summary.last = Some(report);
                    if cancelled {
                        break;
                    }
                    self.interval
                }
                Err(SyncError::Cancelled) => break,
                Err(
                    error @ (SyncError::InvalidConfig(_)
                    | SyncError::UnknownSchema(_)
                    | SyncError::MissingTimestampSource(_)),
                ) => return Err(error),
                Err(error) => {
                    summary.failed_runs += 1;
                    error!(run = summary.runs, error = %error, "scheduled run failed");
                    self.retry_delay
                }
            };

            if self.max_runs.is_some_and(|max| summary.runs >= max) {
                break;
            }
            if ctx.sleep(delay).await.is_err() {
                warn!(runs = summary.runs, "runner cancelled while waiting");
                break;
            }
        }
        Ok(summary)
    }
}
