//! Job storage abstraction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use vectorsync_core::{
    ClaimToken, Job, JobId, JobKey, JobState, JobStats, NewJob, SourceUuid, SourceVersion,
};

use crate::error::StoreError;

/// A row freshly moved to `running` by a claim, as stored.
///
/// `job_type` is kept raw: rows written by other producers may carry types this
/// build does not know, and the claimer must be able to fail them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedJob {
    pub id: JobId,
    pub job_type: String,
    pub source_uuid: SourceUuid,
    pub source_version: Option<SourceVersion>,
    pub collection_key: String,
    pub attempts: u32,
}

/// Result of a lease sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReapOutcome {
    /// Returned to `pending`
    pub requeued: u64,
    /// Out of attempts, moved to `error`
    pub failed: u64,
}

/// Shared job table.
///
/// Every mutating method is a single conditional update, so independent
/// processes can call them concurrently without further coordination.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a job unless its key already exists.
    ///
    /// Returns the new id, or `None` when the key was already present.
    async fn insert_job(&self, job: &NewJob, now: DateTime<Utc>) -> Result<Option<JobId>, StoreError>;

    /// Look up the id of the job with this key.
    async fn find_job_id(&self, key: &JobKey) -> Result<Option<JobId>, StoreError>;

    /// Get a job by ID.
    async fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Move pending upserts for `uuid` in `collection_key` to `superseded`,
    /// except those already carrying `current`. Running jobs are untouched.
    async fn supersede_pending(
        &self,
        uuid: &SourceUuid,
        collection_key: &str,
        current: &SourceVersion,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Ids of claimable jobs, `priority DESC, job_id ASC`.
    async fn select_claimable(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<JobId>, StoreError>;

    /// Move those of `ids` that are still pending to `running` under `token`.
    ///
    /// Returns how many rows this call transitioned.
    async fn mark_running(
        &self,
        ids: &[JobId],
        token: ClaimToken,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Rows among `ids` that are running under `token`.
    async fn load_claimed(&self, ids: &[JobId], token: ClaimToken) -> Result<Vec<ClaimedJob>, StoreError>;

    /// Move a job still running under `token` to `superseded` and drop its lease.
    async fn mark_superseded(
        &self,
        id: JobId,
        token: ClaimToken,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Move a job still running under `token` to `done`, clearing lease and error.
    ///
    /// Returns `false` when the claim was lost (reaped, re-claimed or finished).
    async fn mark_done(&self, id: JobId, token: ClaimToken, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Current attempt count, `None` if the job does not exist.
    async fn load_attempts(&self, id: JobId) -> Result<Option<u32>, StoreError>;

    /// Record a failure on a job still running under `token`: move to `next`
    /// (`pending` or `error`), clear the lease and store `message`.
    async fn release_failed(
        &self,
        id: JobId,
        token: ClaimToken,
        next: JobState,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Return running jobs whose lease lapsed before `now` to `pending`, or to
    /// `error` once they used `max_attempts` claims.
    async fn reap_expired(&self, now: DateTime<Utc>, max_attempts: u32) -> Result<ReapOutcome, StoreError>;

    /// Operator recovery: move an `error` job back to `pending` with a fresh
    /// attempt budget.
    async fn requeue(&self, id: JobId, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// List jobs in `state`, oldest first.
    async fn list_jobs(&self, state: JobState, limit: usize) -> Result<Vec<Job>, StoreError>;

    /// Get job statistics.
    async fn stats(&self) -> Result<JobStats, StoreError>;
}
