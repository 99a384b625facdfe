//! Incremental change detection.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use vectorsync_core::{NewJob, SeenObservation};

use crate::error::StoreError;
use crate::jobs::JobStore;
use crate::ledger::SeenLedger;
use crate::source::SourceCatalog;

/// Result of one change scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChangeScanOutcome {
    /// Source rows read and written through
    pub processed: usize,
    /// Upsert jobs actually inserted (duplicates excluded)
    pub enqueued: usize,
    /// Pending upserts discarded in favour of a newer version
    pub superseded: u64,
    /// Highest `changed_at` processed; equals the input cursor when nothing changed
    pub cursor: DateTime<Utc>,
}

/// Reads changed source rows and turns them into upsert jobs.
pub struct ChangeScanner<S> {
    store: Arc<S>,
    default_collection_key: String,
}

impl<S> ChangeScanner<S>
where
    S: SourceCatalog + SeenLedger + JobStore,
{
    pub fn new(store: Arc<S>, default_collection_key: impl Into<String>) -> Self {
        Self {
            store,
            default_collection_key: default_collection_key.into(),
        }
    }

    /// Scan up to `limit` rows changed after `cursor`.
    pub async fn scan(&self, limit: usize, cursor: DateTime<Utc>) -> Result<ChangeScanOutcome, StoreError> {
        self.scan_at(limit, cursor, Utc::now()).await
    }

    /// Same as [`scan`](Self::scan) with an explicit clock reading.
    ///
    /// Rows are handled oldest first. The returned cursor only covers rows that
    /// were fully processed, so an error part-way leaves the remainder to the
    /// next run.
    pub async fn scan_at(
        &self,
        limit: usize,
        cursor: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ChangeScanOutcome, StoreError> {
        let rows = self.store.changed_since(cursor, limit).await?;

        let mut outcome = ChangeScanOutcome {
            processed: 0,
            enqueued: 0,
            superseded: 0,
            cursor,
        };

        for row in rows {
            let collection_key = row.collection_key(&self.default_collection_key);

            self.store
                .upsert_seen(
                    &SeenObservation {
                        source_uuid: row.uuid,
                        version: row.version.clone(),
                        changed_at: row.changed_at,
                        collection_key: collection_key.clone(),
                    },
                    now,
                )
                .await?;

            let superseded = self
                .store
                .supersede_pending(&row.uuid, &collection_key, &row.version, now)
                .await?;
            if superseded > 0 {
                debug!(
                    source_uuid = %row.uuid,
                    collection = %collection_key,
                    superseded,
                    "superseded stale pending upserts"
                );
            }
            outcome.superseded += superseded;

            let job = NewJob::upsert(row.uuid, row.version.clone(), collection_key);
            if let Some(job_id) = self.store.insert_job(&job, now).await? {
                debug!(%job_id, source_uuid = %row.uuid, "enqueued upsert job");
                outcome.enqueued += 1;
            }

            if row.changed_at > outcome.cursor {
                outcome.cursor = row.changed_at;
            }
            outcome.processed += 1;
        }

        if outcome.processed > 0 {
            info!(
                processed = outcome.processed,
                enqueued = outcome.enqueued,
                superseded = outcome.superseded,
                cursor = %outcome.cursor,
                "change scan finished"
            );
        }

        Ok(outcome)
    }
}
