//! Seen ledger storage abstraction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use vectorsync_core::{JobId, SeenObservation, SeenRecord, SourceUuid};

use crate::error::StoreError;

/// Per-entry record of the last observed version and collection.
#[async_trait]
pub trait SeenLedger: Send + Sync {
    /// Write an observation through; re-observing clears deletion state.
    async fn upsert_seen(&self, obs: &SeenObservation, now: DateTime<Utc>) -> Result<(), StoreError>;

    /// Get the ledger row for `uuid`.
    async fn get_seen(&self, uuid: &SourceUuid) -> Result<Option<SeenRecord>, StoreError>;

    /// Ledger rows whose source entry no longer exists and that are not yet
    /// marked missing.
    async fn list_vanished(&self, limit: usize) -> Result<Vec<SeenRecord>, StoreError>;

    /// Set `missing_since` if still unset. Returns whether this call set it.
    async fn mark_missing(&self, uuid: &SourceUuid, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Record the delete job created for a vanished entry.
    async fn set_delete_job(&self, uuid: &SourceUuid, job_id: JobId) -> Result<(), StoreError>;

    /// Stamp `deleted_at` on the row for `uuid` if it still belongs to
    /// `collection_key`.
    async fn mark_deleted(
        &self,
        uuid: &SourceUuid,
        collection_key: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;
}
