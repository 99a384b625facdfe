//! Producer side: change and delete detection, and the scheduled enqueue run
//! that drives both.

pub mod changes;
pub mod deletions;

pub use changes::{ChangeScanOutcome, ChangeScanner};
pub use deletions::DeletionScanner;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument};

use crate::checkpoint::CheckpointStore;
use crate::config::QueueConfig;
use crate::error::StoreError;
use crate::jobs::JobStore;
use crate::ledger::SeenLedger;
use crate::source::{SchemaBootstrap, SourceCatalog};

/// What a single enqueue run did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EnqueueReport {
    /// Throttled; nothing was scanned.
    Skipped,
    Done {
        changed: usize,
        deleted: usize,
        cursor: DateTime<Utc>,
    },
}

impl std::fmt::Display for EnqueueReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnqueueReport::Skipped => f.write_str("Skip (min interval not reached)"),
            EnqueueReport::Done {
                changed, deleted, ..
            } => write!(f, "Enqueue done - changed: {}, deletes: {}", changed, deleted),
        }
    }
}

/// One scheduled producer run: throttle, change scan, cursor advance,
/// deletion scan, touch.
pub struct EnqueueRun<S> {
    store: Arc<S>,
    config: QueueConfig,
    changes: ChangeScanner<S>,
    deletions: DeletionScanner<S>,
}

impl<S> EnqueueRun<S>
where
    S: SchemaBootstrap + CheckpointStore + SourceCatalog + SeenLedger + JobStore,
{
    pub fn new(store: Arc<S>, config: QueueConfig) -> Self {
        let changes = ChangeScanner::new(store.clone(), config.default_collection_key.clone());
        let deletions = DeletionScanner::new(store.clone(), config.default_collection_key.clone());
        Self {
            store,
            config,
            changes,
            deletions,
        }
    }

    pub async fn run(&self) -> Result<EnqueueReport, StoreError> {
        self.run_at(Utc::now()).await
    }

    /// Run with an explicit clock reading.
    ///
    /// A throttled run only ensures the schema. Errors abort the run before
    /// the checkpoint is touched; the cursor is advanced only over rows the
    /// change scan fully processed.
    #[instrument(skip(self, now), fields(checkpoint = %self.config.checkpoint_name), err)]
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<EnqueueReport, StoreError> {
        let name = self.config.checkpoint_name.as_str();

        self.store.ensure_schema(name).await?;

        let checkpoint = self.store.load_checkpoint(name).await?;
        if !checkpoint.should_run(now, self.config.min_interval) {
            info!(last_run_at = ?checkpoint.last_run_at, "enqueue run throttled");
            return Ok(EnqueueReport::Skipped);
        }

        let changes = self
            .changes
            .scan_at(self.config.changed_batch, checkpoint.last_changed, now)
            .await?;
        if changes.processed > 0 {
            self.store.advance_checkpoint(name, changes.cursor).await?;
        }

        let deleted = self.deletions.scan_at(self.config.delete_batch, now).await?;

        self.store.touch_checkpoint(name, now).await?;

        let report = EnqueueReport::Done {
            changed: changes.processed,
            deleted,
            cursor: changes.cursor,
        };
        info!(%report, "enqueue run finished");
        Ok(report)
    }
}
