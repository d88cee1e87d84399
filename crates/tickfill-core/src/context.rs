//! Per-run context passed to every sync component.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::Span;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::SyncError;

/// Clock, cancellation signal and log span of one sync run.
#[derive(Clone)]
pub struct RunContext {
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    run_id: String,
    span: Span,
}

impl RunContext {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let run_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!(
            "sync_run",
            run_id = %run_id,
            schema = tracing::field::Empty
        );
        Self {
            clock,
            cancel: CancellationToken::new(),
            run_id,
            span,
        }
    }

    pub fn system() -> Self {
        Self::new(Arc::new(SystemClock))
    }

    /// Share an external cancellation token, e.g. one tripped by Ctrl-C.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// A context for the next run: same clock and cancellation, fresh run id.
    #[must_use]
    pub fn next_run(&self) -> Self {
        Self::new(Arc::clone(&self.clock)).with_cancel(self.cancel.clone())
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    /// Fail with [`SyncError::Cancelled`] once cancellation was requested.
    pub fn ensure_active(&self) -> Result<(), SyncError> {
        if self.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }

    /// Sleep on the run clock unless cancellation arrives first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), SyncError> {
        self.ensure_active()?;
        if duration.is_zero() {
            return Ok(());
        }

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(SyncError::Cancelled),
            () = self.clock.sleep(duration) => Ok(()),
        }
    }

    /// Await `future` for at most `duration` of run-clock time. `Ok(None)`
    /// means the deadline passed first.
    pub async fn timeout<F: Future>(
        &self,
        duration: Duration,
        future: F,
    ) -> Result<Option<F::Output>, SyncError> {
        self.ensure_active()?;
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(SyncError::Cancelled),
            output = future => Ok(Some(output)),
            () = self.clock.sleep(duration) => Ok(None),
        }
    }
}
