//! Delete detection via the seen ledger.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use vectorsync_core::{NewJob, normalize_collection_key};

use crate::error::StoreError;
use crate::jobs::JobStore;
use crate::ledger::SeenLedger;

/// Finds entries that vanished from the source and enqueues delete jobs.
///
/// The collection to delete from comes from the ledger, since the source row
/// that would otherwise say so no longer exists.
pub struct DeletionScanner<S> {
    store: Arc<S>,
    default_collection_key: String,
}

impl<S> DeletionScanner<S>
where
    S: SeenLedger + JobStore,
{
    pub fn new(store: Arc<S>, default_collection_key: impl Into<String>) -> Self {
        Self {
            store,
            default_collection_key: default_collection_key.into(),
        }
    }

    /// Handle up to `limit` vanished entries. Returns how many were marked.
    pub async fn scan(&self, limit: usize) -> Result<usize, StoreError> {
        self.scan_at(limit, Utc::now()).await
    }

    pub async fn scan_at(&self, limit: usize, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let vanished = self.store.list_vanished(limit).await?;
        let mut processed = 0;

        for seen in vanished {
            // Another scanner may have marked it between list and update.
            if !self.store.mark_missing(&seen.source_uuid, now).await? {
                debug!(source_uuid = %seen.source_uuid, "already marked missing");
                continue;
            }

            let collection_key = normalize_collection_key(
                Some(&seen.last_seen_collection_key),
                &self.default_collection_key,
            );
            let job = NewJob::delete(seen.source_uuid, seen.last_seen_version.clone(), collection_key);

            let job_id = match self.store.insert_job(&job, now).await? {
                Some(id) => Some(id),
                None => self.store.find_job_id(&job.key).await?,
            };

            match job_id {
                Some(job_id) => {
                    self.store.set_delete_job(&seen.source_uuid, job_id).await?;
                    debug!(%job_id, source_uuid = %seen.source_uuid, "enqueued delete job");
                }
                None => warn!(
                    source_uuid = %seen.source_uuid,
                    "delete job neither inserted nor found"
                ),
            }

            processed += 1;
        }

        if processed > 0 {
            info!(deleted = processed, "deletion scan finished");
        }

        Ok(processed)
    }
}
