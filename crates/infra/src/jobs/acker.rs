//! Success and failure reporting for claimed work.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use vectorsync_core::{ClaimToken, JobId, JobState, RetryPolicy, WorkItem, clamp_error_message};

use crate::error::StoreError;
use crate::jobs::store::JobStore;
use crate::ledger::SeenLedger;

/// Called by the executor once it is finished with a [`WorkItem`].
pub struct Acker<S> {
    store: Arc<S>,
    retry: RetryPolicy,
}

impl<S> Acker<S>
where
    S: JobStore + SeenLedger,
{
    pub fn new(store: Arc<S>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Mark the item's job done.
    ///
    /// Returns `false` if the job does not exist or the item's claim no longer
    /// holds (lease reaped, job re-claimed or already finished).
    pub async fn ack(&self, item: &WorkItem) -> Result<bool, StoreError> {
        self.ack_at(item, Utc::now()).await
    }

    /// Deletes also stamp `deleted_at` on the ledger row, which stays in place
    /// as an audit trail.
    pub async fn ack_at(&self, item: &WorkItem, now: DateTime<Utc>) -> Result<bool, StoreError> {
        if !self
            .store
            .mark_done(item.job_id, item.claim_token, now)
            .await?
        {
            warn!(job_id = %item.job_id, claim_token = %item.claim_token, "ack ignored, claim lost");
            return Ok(false);
        }

        if item.is_delete() {
            let collection_key = item.collection_key.trim();
            if !item.metadata.content_uuid.is_nil() && !collection_key.is_empty() {
                self.store
                    .mark_deleted(&item.metadata.content_uuid, collection_key, now)
                    .await?;
            }
        }

        debug!(job_id = %item.job_id, action = %item.job_type(), "job done");
        Ok(true)
    }

    /// Record a failed item.
    ///
    /// Returns the state the job moved to, or `None` if it does not exist or
    /// the item's claim no longer holds.
    pub async fn fail(
        &self,
        item: &WorkItem,
        message: &str,
        retryable: bool,
    ) -> Result<Option<JobState>, StoreError> {
        self.fail_job(item.job_id, item.claim_token, message, retryable, Utc::now())
            .await
    }

    pub async fn fail_at(
        &self,
        item: &WorkItem,
        message: &str,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<JobState>, StoreError> {
        self.fail_job(item.job_id, item.claim_token, message, retryable, now)
            .await
    }

    /// Non-retryable failures and failures on the last allowed attempt are
    /// terminal; anything else goes back to `pending` for immediate re-claim.
    pub(crate) async fn fail_job(
        &self,
        job_id: JobId,
        token: ClaimToken,
        message: &str,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<JobState>, StoreError> {
        let Some(attempts) = self.store.load_attempts(job_id).await? else {
            warn!(%job_id, "fail for unknown job ignored");
            return Ok(None);
        };

        let next = self.retry.state_after_failure(attempts, retryable);
        let message = clamp_error_message(message);
        if !self
            .store
            .release_failed(job_id, token, next, &message, now)
            .await?
        {
            warn!(%job_id, claim_token = %token, "fail ignored, claim lost");
            return Ok(None);
        }

        match next {
            JobState::Error => warn!(%job_id, attempts, retryable, error = %message, "job failed terminally"),
            _ => info!(%job_id, attempts, error = %message, "job failed, will retry"),
        }

        Ok(Some(next))
    }
}
