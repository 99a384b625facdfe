//! Consumer run: claim a batch, hand each item to an [`Executor`], route the
//! outcome to the acker.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use vectorsync_core::{RetryPolicy, WorkItem};

use crate::error::StoreError;
use crate::jobs::acker::Acker;
use crate::jobs::claimer::Claimer;
use crate::jobs::store::JobStore;
use crate::ledger::SeenLedger;
use crate::source::EntryResolver;

/// Outcome of a successful execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Vectors written or removed.
    Done,
    /// Nothing to do (e.g. the backend already holds this content hash).
    Skipped,
}

/// Failure reported by an executor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ExecutionError {
    pub message: String,
    /// Whether another attempt may succeed.
    pub retryable: bool,
}

impl ExecutionError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// The embedding engine. Computes vectors for upserts and removes them for
/// deletes; keyed by `content_hash` for idempotency.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, item: &WorkItem) -> Result<ExecutionOutcome, ExecutionError>;
}

#[async_trait]
impl<E> Executor for Arc<E>
where
    E: Executor + ?Sized,
{
    async fn execute(&self, item: &WorkItem) -> Result<ExecutionOutcome, ExecutionError> {
        (**self).execute(item).await
    }
}

/// Counters of one worker run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerReport {
    /// Items executed and acked
    pub items: usize,
    /// Items the executor failed
    pub failed: usize,
    /// Items the executor had nothing to do for (acked as well)
    pub skipped: usize,
}

impl std::fmt::Display for WorkerReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Worker done - items: {}, failed: {}, skipped: {}",
            self.items, self.failed, self.skipped
        )
    }
}

pub struct WorkerRun<S, E> {
    claimer: Claimer<S>,
    acker: Acker<S>,
    executor: E,
    limit: usize,
}

impl<S, E> WorkerRun<S, E>
where
    S: JobStore + SeenLedger + EntryResolver,
    E: Executor,
{
    pub fn new(store: Arc<S>, retry: RetryPolicy, executor: E, limit: usize) -> Self {
        Self {
            claimer: Claimer::new(store.clone(), retry),
            acker: Acker::new(store, retry),
            executor,
            limit,
        }
    }

    pub async fn run(&self) -> Result<WorkerReport, StoreError> {
        self.run_at(Utc::now()).await
    }

    /// Executor errors are recorded on the job and never escape; only store
    /// errors abort the run.
    #[instrument(skip(self, now), fields(limit = self.limit), err)]
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<WorkerReport, StoreError> {
        let items = self.claimer.claim_at(self.limit, now).await?;
        let mut report = WorkerReport::default();

        for item in &items {
            match self.executor.execute(item).await {
                Ok(outcome) => {
                    self.acker.ack_at(item, now).await?;
                    match outcome {
                        ExecutionOutcome::Done => report.items += 1,
                        ExecutionOutcome::Skipped => report.skipped += 1,
                    }
                    debug!(job_id = %item.job_id, ?outcome, "item executed");
                }
                Err(err) => {
                    warn!(
                        job_id = %item.job_id,
                        retryable = err.retryable,
                        error = %err,
                        "item execution failed"
                    );
                    self.acker
                        .fail_at(item, &err.message, err.retryable, now)
                        .await?;
                    report.failed += 1;
                }
            }
        }

        info!(%report, "worker run finished");
        Ok(report)
    }
}
